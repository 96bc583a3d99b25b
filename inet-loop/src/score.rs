use core::fmt;

use inet::time::Duration;

/// The result of one transfer.
pub struct Score {
    /// Bytes the server read, all of them verified.
    pub(crate) data_len: u64,
    /// Simulated time from the connect until the server saw the end of the stream.
    pub(crate) time: Duration,
    /// Segments put on both links.
    pub(crate) segments: u32,
    /// Segments the links lost on purpose.
    pub(crate) dropped: u32,
}

impl Score {
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    fn total_kb(&self) -> u64 {
        self.data_len / 1024
    }

    fn elapsed_secs(&self) -> f32 {
        self.time.as_millis() as f32 / 1000.0
    }

    fn effective_rate(&self) -> f32 {
        (self.data_len as f32) / self.elapsed_secs().max(0.001)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Transferred: {} kB in {:.3} s", self.total_kb(), self.elapsed_secs())?;
        writeln!(f, "Rate: {:.1} kB/s (simulated)", self.effective_rate() / 1024.0)?;
        write!(f, "Segments: {} ({} dropped)", self.segments, self.dropped)
    }
}
