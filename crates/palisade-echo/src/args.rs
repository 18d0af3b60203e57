use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "palisade_echo", about = "TCP echo server on the palisade runtime")]
pub struct Args {
    /// Interface to listen on
    #[arg(long, short, default_value = "127.0.0.1", env = "PALISADE_ECHO_INTERFACE")]
    pub interface: String,

    /// TCP port to listen on (0 picks a free port)
    #[arg(long, short, default_value_t = 7777, env = "PALISADE_ECHO_PORT")]
    pub port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 1024)]
    pub backlog: u32,

    /// Workers in the IO group
    #[arg(long, default_value_t = 2)]
    pub io_workers: u16,

    /// Workers in the logic group (timer/AOD capable)
    #[arg(long, default_value_t = 2)]
    pub logic_workers: u16,

    /// Tick rate of the logic group, Hz
    #[arg(long, default_value_t = 60)]
    pub tick_rate: u16,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
