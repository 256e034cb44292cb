//! Status transition tables with wildcard rules and per-transition callbacks.

use std::fmt::Display;

use anyhow::Result;

use crate::error::FsmError;

/// One side of a transition rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge<S> {
    /// Any status.
    Any,
    Is(S),
}

/// A callback runs after an allowed transition and may ask for the next status.
pub type Callback<S, C> = Box<dyn Fn(&mut C) -> Result<Option<S>> + Send + Sync>;

/// A transition table plus callbacks, built once per resource kind.
///
/// `C` is whatever the callbacks act on; for resources that is the hook context.
pub struct Fsm<S, C> {
    transitions: Vec<(Edge<S>, Edge<S>)>,
    callbacks: Vec<((S, S), Callback<S, C>)>,
}

impl<S, C> Default for Fsm<S, C> {
    fn default() -> Self {
        Fsm {
            transitions: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

impl<S, C> Fsm<S, C>
where
    S: Copy + PartialEq + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, from: Edge<S>, to: Edge<S>) -> Self {
        self.transitions.push((from, to));
        self
    }

    /// Allow each consecutive pair of `steps`.
    pub fn chain(mut self, steps: &[S]) -> Self {
        for pair in steps.windows(2) {
            self.transitions.push((Edge::Is(pair[0]), Edge::Is(pair[1])));
        }
        self
    }

    pub fn on(
        mut self,
        from: S,
        to: S,
        callback: impl Fn(&mut C) -> Result<Option<S>> + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.push(((from, to), Box::new(callback)));
        self
    }

    /// Check whether `old -> new` may happen. A rule `(ANY, new)`, `(old, ANY)`
    /// or `(old, new)` allows it.
    pub fn switch_status(&self, old: S, new: S) -> Result<(), FsmError> {
        let allowed = self.transitions.iter().any(|(from, to)| match (from, to) {
            (Edge::Any, Edge::Is(to)) => *to == new,
            (Edge::Is(from), Edge::Any) => *from == old,
            (Edge::Is(from), Edge::Is(to)) => *from == old && *to == new,
            (Edge::Any, Edge::Any) => true,
        });
        if allowed {
            Ok(())
        } else {
            Err(FsmError {
                from: old.to_string(),
                to: new.to_string(),
            })
        }
    }

    pub fn has_callback(&self, old: S, new: S) -> bool {
        self.callbacks
            .iter()
            .any(|((from, to), _)| *from == old && *to == new)
    }

    /// Check the transition, then run the callback registered for it, if any.
    /// Returns the status the callback wants next.
    pub fn transition(&self, old: S, new: S, context: &mut C) -> Result<Option<S>> {
        self.switch_status(old, new)?;
        match self
            .callbacks
            .iter()
            .find(|((from, to), _)| *from == old && *to == new)
        {
            Some((_, callback)) => callback(context),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Off,
        Warming,
        On,
        Broken,
    }
    impl Display for Light {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn fsm() -> Fsm<Light, Vec<String>> {
        Fsm::new()
            .chain(&[Light::Off, Light::Warming, Light::On])
            .allow(Edge::Any, Edge::Is(Light::Broken))
            .allow(Edge::Is(Light::On), Edge::Any)
            .on(Light::Off, Light::Warming, |log: &mut Vec<String>| {
                log.push("warming".to_string());
                Ok(Some(Light::On))
            })
    }

    #[test]
    fn test_exact_rule() {
        let fsm = fsm();
        assert!(fsm.switch_status(Light::Off, Light::Warming).is_ok());
        assert!(fsm.switch_status(Light::Warming, Light::On).is_ok());
        let err = fsm.switch_status(Light::Off, Light::On).unwrap_err();
        assert_eq!(err.from, "Off");
        assert_eq!(err.to, "On");
    }

    #[test]
    fn test_wildcard_from() {
        let fsm = fsm();
        assert!(fsm.switch_status(Light::Warming, Light::Broken).is_ok());
        assert!(fsm.switch_status(Light::Off, Light::Broken).is_ok());
    }

    #[test]
    fn test_wildcard_to() {
        let fsm = fsm();
        assert!(fsm.switch_status(Light::On, Light::Off).is_ok());
        assert!(fsm.switch_status(Light::On, Light::Warming).is_ok());
        assert!(fsm.switch_status(Light::Warming, Light::Off).is_err());
        assert!(fsm.switch_status(Light::Broken, Light::Off).is_err());
    }

    #[test]
    fn test_callback_returns_next_status() {
        let fsm = fsm();
        let mut log = Vec::new();
        let next = fsm.transition(Light::Off, Light::Warming, &mut log).unwrap();
        assert_eq!(next, Some(Light::On));
        assert_eq!(log, vec!["warming"]);
        // no callback registered
        let next = fsm.transition(Light::Warming, Light::On, &mut log).unwrap();
        assert_eq!(next, None);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_disallowed_transition_skips_callback() {
        let fsm = fsm();
        let mut log = Vec::new();
        let err = fsm.transition(Light::Broken, Light::Warming, &mut log).unwrap_err();
        assert!(err.downcast_ref::<FsmError>().is_some());
        assert!(log.is_empty());
    }
}
