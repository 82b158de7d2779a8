#![allow(unused)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use damage_batch::{EncoderError, GlobalStatistics, SharedEncoder, VideoEncoder};
use parking_lot::Mutex;

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

/// Encoder that remembers what it was set to.
#[derive(Debug, Default)]
pub struct MockEncoder {
    pub closed: bool,
    pub fail: bool,
    pub speed: Option<u8>,
    pub quality: Option<u8>,
    pub calls: usize,
}

impl MockEncoder {
    pub fn shared(self) -> Arc<Mutex<MockEncoder>> {
        Arc::new(Mutex::new(self))
    }
}

impl VideoEncoder for MockEncoder {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn set_encoding_speed(&mut self, speed: u8) -> Result<(), EncoderError> {
        self.calls += 1;
        if self.fail {
            return Err(EncoderError::new("speed rejected"));
        }
        self.speed = Some(speed);
        Ok(())
    }

    fn set_encoding_quality(&mut self, quality: u8) -> Result<(), EncoderError> {
        self.calls += 1;
        if self.fail {
            return Err(EncoderError::new("quality rejected"));
        }
        self.quality = Some(quality);
        Ok(())
    }
}

pub fn as_shared(enc: &Arc<Mutex<MockEncoder>>) -> SharedEncoder {
    enc.clone()
}

/// Feeds `n` acks spaced `every` apart, each taking `latency` on the wire.
pub fn feed_latency(global: &GlobalStatistics, start: Instant, n: u32, every: Duration, latency: Duration) -> Instant {
    let mut now = start;
    for i in 0..n {
        let sent = start + every * i;
        now = sent + latency;
        global.record_latency(now, 1, 0.0, sent, 100 * 100);
    }
    now
}
