use super::{Frontend, Options};
use anyhow::{Context as _, Result};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt as _,
    Layer, Registry,
};

/// Log lines on stderr, for a terminal or the service log.
#[derive(Default)]
pub(crate) struct HeadlessLogger {
    installed: bool,
}

fn span_events(verbose: bool) -> FmtSpan {
    if verbose {
        FmtSpan::FULL
    } else {
        // changeset spans: one line when started, one when finished
        FmtSpan::NEW | FmtSpan::CLOSE
    }
}

impl Frontend for HeadlessLogger {
    fn set_up(&mut self, options: &Options) -> Result<()> {
        let base = fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(span_events(options.verbose))
            .with_ansi(options.color);
        let layer = if options.service {
            base.with_target(true).boxed()
        } else {
            base.without_time().with_target(options.verbose).compact().boxed()
        };
        let subscriber =
            Registry::default().with(layer.with_filter(LevelFilter::from_level(options.level())));
        tracing::subscriber::set_global_default(subscriber)
            .context("installing the log subscriber")?;
        self.installed = true;
        Ok(())
    }

    fn tear_down(&mut self) -> Result<()> {
        if self.installed {
            tracing::trace!("logging stopped");
        }
        Ok(())
    }
}
