mod application;
mod changesets;
mod interrupt;
mod logging;
mod options;
mod resource;
mod run;

use anyhow::Result;
use application::{handle_result, App};
use clap::{CommandFactory as _, Parser, Subcommand};
use felis_ledger::{
    dispatch::InlineDispatch,
    scheduler::{Scheduler, SchedulerOptions},
};
use options::Options;
use std::sync::Arc;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "felis", &mut std::io::stdout());
            Ok(())
        }
        command => {
            let mut logger = logging::set_up(logging::Options {
                verbose: args.options.verbose,
                color: args.options.use_color(),
                service: matches!(command, Commands::Run(_)),
            })?;
            let result = run_command(&args.options, command);
            logger.tear_down()?;
            result
        }
    }
}

fn run_command(options: &Options, command: &Commands) -> Result<()> {
    match command {
        Commands::Run(subargs) => {
            let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
            run::run(options, subargs, &interrupt_state)
        }
        Commands::Sweep => sweep(options),
        Commands::Changesets(subargs) => changesets::list(options, subargs),
        Commands::Resource(sub) => resource::resource(options, sub),
        Commands::GenerateMan | Commands::GenerateMarkdown | Commands::GenerateCompletion { .. } => {
            Ok(())
        }
    }
}

/// One sweep, with every started changeset executed before returning.
/// Executed inline, so nothing a changeset records runs before the next sweep.
fn sweep(options: &Options) -> Result<()> {
    let app = App::open(options, None)?;
    let scheduler = Scheduler::new(
        app.executor(),
        Arc::new(InlineDispatch),
        SchedulerOptions::default(),
    );
    let report = scheduler.sweep();
    for id in &report.started {
        let cs = app.ledger.store().changeset(*id);
        let state = cs.map_or_else(|| "?".to_string(), |cs| cs.state().to_string());
        println!("{} {}", id, state);
    }
    for (label, ids) in [
        ("waiting", &report.waiting),
        ("rolled back with a dependency", &report.cascaded),
        ("deferred", &report.deferred),
        ("rolled back as stale", &report.reaped),
    ] {
        if !ids.is_empty() {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            println!("{}: {}", label, ids.join(" "));
        }
    }
    Ok(())
}

/// felis: FreeBSD jails, their ZFS datasets, addresses and limits, changed
/// through a ledger of changesets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler and the collectors until interrupted
    #[command()]
    Run(run::Args),

    /// Start every changeset that can start now, and wait for them
    ///
    /// Changesets run one after another in this process. Changesets they
    /// record are left for the next sweep, so a world installation that has
    /// to stop running jails fails here; `felis run` waits for the jails.
    Sweep,

    /// Show recorded changesets
    Changesets(changesets::Args),

    /// Create, change, inspect and remove resources
    #[command(subcommand)]
    Resource(resource::Command),

    /// Generate markdown documentation for felis
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for felis
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for felis
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
