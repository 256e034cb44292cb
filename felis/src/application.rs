use crate::options::Options;
use anyhow::{Context, Result};
use felis_ledger::{
    exec::{CommandRunner, PrivilegedRunner},
    executor::Executor,
    journal::JournalStore,
    Ledger,
};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

/// Create the single-threaded tokio runtime used by the CLI.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("felis error: {:?}", e);
            exit(1);
        }
    }
}

/// The ledger over the journal named by the options, with every resource kind
/// registered, and the runner for host commands.
pub struct App {
    pub ledger: Arc<Ledger>,
    pub runner: Arc<dyn CommandRunner>,
}

impl App {
    pub fn open(options: &Options, world_stop_timeout: Option<Duration>) -> Result<App> {
        let store = JournalStore::open(&options.state)
            .with_context(|| format!("opening state {}", options.state.display()))?;
        let mut config = felis_resources::Config::new(&options.scripts_dir, &options.work_dir);
        if let Some(timeout) = world_stop_timeout {
            config.world_stop_timeout = timeout;
        }
        let registry = felis_resources::registry(config);
        Ok(App {
            ledger: Arc::new(Ledger::new(Arc::new(store), Arc::new(registry))),
            runner: Arc::new(PrivilegedRunner::new(options.elevate())),
        })
    }

    pub fn executor(&self) -> Arc<Executor> {
        Arc::new(Executor::new(self.ledger.clone(), self.runner.clone()))
    }
}
