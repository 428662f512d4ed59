use crate::lockfree::SeqLock;

/// Tempo and position authority read by the scheduler and router.
pub trait TransportClock: Send + Sync {
    fn bpm(&self) -> f64;
    fn beat(&self) -> f64;
    fn is_playing(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportState {
    pub bpm: f64,
    pub beat: f64,
    pub playing: bool,
}

/// Internal transport. Advanced by the realtime loop once per block; read
/// wait-free from any thread.
pub struct SharedTransport {
    state: SeqLock<TransportState>,
}

impl SharedTransport {
    pub fn new(bpm: f64) -> Self {
        Self {
            state: SeqLock::new(TransportState {
                bpm,
                beat: 0.0,
                playing: true,
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state.read()
    }

    /// Move the playhead by one block. Returns the beat span covered.
    pub fn advance(&self, num_samples: usize, sample_rate: f64) -> (f64, f64) {
        let mut span = (0.0, 0.0);
        self.state.update(|state| {
            let start = state.beat;
            if state.playing && sample_rate > 0.0 {
                state.beat += num_samples as f64 / sample_rate * state.bpm / 60.0;
            }
            span = (start, state.beat);
        });
        span
    }

    pub fn set_bpm(&self, bpm: f64) {
        if bpm.is_finite() && bpm > 0.0 {
            self.state.update(|state| state.bpm = bpm);
        }
    }

    pub fn seek(&self, beat: f64) {
        self.state.update(|state| state.beat = beat);
    }

    pub fn start(&self) {
        self.state.update(|state| {
            state.beat = 0.0;
            state.playing = true;
        });
    }

    pub fn resume(&self) {
        self.state.update(|state| state.playing = true);
    }

    pub fn stop(&self) {
        self.state.update(|state| state.playing = false);
    }
}

impl TransportClock for SharedTransport {
    fn bpm(&self) -> f64 {
        self.state().bpm
    }

    fn beat(&self) -> f64 {
        self.state().beat
    }

    fn is_playing(&self) -> bool {
        self.state().playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_one_beat() {
        let transport = SharedTransport::new(120.0);
        // Half a second at 120 BPM is one beat.
        let (start, end) = transport.advance(24_000, 48_000.0);
        assert_eq!(start, 0.0);
        assert!((end - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stopped_transport_holds_position() {
        let transport = SharedTransport::new(120.0);
        transport.advance(48_000, 48_000.0);
        transport.stop();
        let before = transport.beat();
        transport.advance(48_000, 48_000.0);
        assert_eq!(transport.beat(), before);
        assert!(!transport.is_playing());

        transport.start();
        assert_eq!(transport.beat(), 0.0);
        assert!(transport.is_playing());
    }
}
