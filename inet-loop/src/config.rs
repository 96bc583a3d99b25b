use structopt::StructOpt;

use inet::buf::{self, Class};

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "inet-loop", about = "Transfer bytes between two engines over a simulated link.")]
pub struct Config {
    /// Number of bytes the client sends.
    #[structopt(short = "n", long = "bytes", default_value = "1048576")]
    pub bytes: usize,

    /// Bytes per write and per read.
    #[structopt(short = "l", long = "chunk", default_value = "8192")]
    pub chunk: usize,

    /// MTU of the link, larger segments with the don't-fragment bit are refused.
    #[structopt(long = "mtu", default_value = "1500")]
    pub mtu: usize,

    /// Size of the large pool segments.
    #[structopt(long = "segment-size", default_value = "2048")]
    pub segment_size: usize,

    /// Number of large pool segments.
    #[structopt(long = "segments", default_value = "256")]
    pub segments: usize,

    /// Segments a link holds before it reports to be busy.
    #[structopt(long = "queue", default_value = "64")]
    pub queue: usize,

    /// Milliseconds a round of deliveries takes.
    #[structopt(long = "latency", default_value = "1")]
    pub latency: u32,

    /// Lose every n-th segment on each link, 0 loses none.
    #[structopt(long = "drop-every", default_value = "0")]
    pub drop_every: usize,

    #[structopt(long = "port", default_value = "5001")]
    pub port: u16,

    /// Give up after this many simulated seconds.
    #[structopt(long = "timeout", default_value = "600")]
    pub timeout: u32,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbose: u8,
}

impl Config {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }

    /// Dimensions of the pool both engines share.
    pub fn pool(&self) -> buf::Config {
        buf::Config {
            classes: vec![
                Class { size: 512, count: 4 * self.segments },
                Class { size: self.segment_size, count: self.segments },
            ],
            nodes: 16 * self.segments,
        }
    }
}
