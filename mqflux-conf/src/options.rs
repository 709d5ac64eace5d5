use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "mqflux", about = "IoT message plane")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Consumer (subject and transformer) config filename, overrides `writer.consumer_config`
    #[structopt(name = "consumer-config", long)]
    pub consumer_cfg_name: Option<String>,

    #[structopt(subcommand)]
    pub command: Option<Command>,
}

impl Options {
    #[inline]
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Standalone)
    }
}

#[derive(StructOpt, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// MQTT hook surface, session handler and cache invalidator
    Adapter,
    /// Consumer runtime feeding the configured storage writer
    Writer,
    /// Republishes bus messages onto the MQTT broker
    Forwarder,
    /// Adapter, writer and forwarder in one process on the in-memory bus
    Standalone,
}
