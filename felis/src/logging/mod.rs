mod headless;

use anyhow::Result;

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
    /// Long-running service: timestamped lines with their target.
    pub service: bool,
}

impl Options {
    fn level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::INFO
        }
    }
}

pub(crate) trait Frontend {
    fn set_up(&mut self, options: &Options) -> Result<()>;
    fn tear_down(&mut self) -> Result<()>;
}

pub(crate) fn set_up(options: Options) -> Result<Box<dyn Frontend>> {
    let mut logger = headless::HeadlessLogger::default();
    logger.set_up(&options)?;
    Ok(Box::new(logger))
}
