use crate::events::Event;

/// Receives events bound for the realtime output (MIDI out or an internal
/// synth). `sample_offset` is the position inside the current block; router
/// output is always delivered at offset 0.
pub trait OutputConsumer: Send {
    fn deliver(&mut self, event: Event, sample_offset: usize);
}

impl<F> OutputConsumer for F
where
    F: FnMut(Event, usize) + Send,
{
    fn deliver(&mut self, event: Event, sample_offset: usize) {
        self(event, sample_offset)
    }
}
