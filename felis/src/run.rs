use std::{sync::Arc, time::Duration};

use anyhow::Result;
use felis_ledger::{
    dispatch::TokioDispatch,
    scheduler::{Scheduler, SchedulerOptions},
};
use tokio::time::MissedTickBehavior;

use crate::{
    application::{self, App},
    interrupt::InterruptState,
    options::Options,
};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// Seconds between sweeps when nothing new was recorded
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Seconds after which a running changeset is rolled back
    #[arg(long, default_value_t = 4 * 60 * 60)]
    stale_after: u64,

    /// Seconds between collector runs; 0 disables the collectors
    #[arg(long, default_value_t = 60)]
    collect_interval: u64,

    /// Seconds a world installation waits for its jails to stop
    #[arg(long, default_value_t = 10)]
    world_stop_timeout: u64,
}

impl Args {
    fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            interval: Duration::from_secs(self.interval.max(1)),
            stale_after: Duration::from_secs(self.stale_after),
        }
    }
}

/// Drive the scheduler and the collectors until interrupted.
pub(crate) fn run(options: &Options, args: &Args, interrupt_state: &InterruptState) -> Result<()> {
    let app = App::open(options, Some(Duration::from_secs(args.world_stop_timeout)))?;
    application::runtime()?.block_on(async {
        let scheduler = Arc::new(Scheduler::new(
            app.executor(),
            Arc::new(TokioDispatch::current()),
            args.scheduler_options(),
        ));
        tracing::info!(state = %options.state.display(), "felis running");

        let collectors = (args.collect_interval > 0).then(|| {
            tokio::spawn(collect_loop(
                app,
                Duration::from_secs(args.collect_interval),
                interrupt_state.clone(),
            ))
        });

        let interrupted = interrupt_state.clone();
        scheduler
            .clone()
            .run(async move { interrupted.interrupted().await })
            .await;

        if let Some(collectors) = collectors {
            if let Err(e) = collectors.await {
                tracing::error!("collector task failed: {}", e);
            }
        }
        if interrupt_state.is_interrupted() {
            tracing::info!("stopping after interrupt");
        }
        for handle in scheduler.in_flight() {
            tracing::info!(changeset = %handle.changeset(), "waiting for running changeset");
            if let Err(e) = handle.wait().await {
                tracing::warn!(changeset = %handle.changeset(), "{:#}", e);
            }
        }
        Ok(())
    })
}

async fn collect_loop(app: App, every: Duration, interrupt_state: InterruptState) {
    let app = Arc::new(app);
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interrupt_state.interrupted() => break,
            _ = tick.tick() => {}
        }
        let app = app.clone();
        let collected = tokio::task::spawn_blocking(move || {
            felis_resources::collect::collect(&app.ledger, app.runner.as_ref())
        })
        .await;
        if let Err(e) = collected {
            tracing::error!("collectors failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    #[derive(clap::Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: Args,
    }

    #[test]
    fn test_scheduler_options() {
        let args = Wrapper::parse_from(["run", "--interval", "0", "--stale-after", "60"]).args;
        let options = args.scheduler_options();
        assert_eq!(options.interval, Duration::from_secs(1));
        assert_eq!(options.stale_after, Duration::from_secs(60));
        assert_eq!(args.collect_interval, 60);
    }
}
