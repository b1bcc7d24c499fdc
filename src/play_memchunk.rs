//! One-shot playback of an in-memory chunk through a throwaway
//! sink-input.

use std::rc::{Rc, Weak};

use crate::core::Core;
use crate::error::Error;
use crate::mainloop::{DeferEvent, EventLoop};
use crate::memblock::Memchunk;
use crate::sample::SampleSpec;
use crate::sink::Sink;
use crate::sink_input::{SinkInput, SinkInputProducer};
use crate::volume::ChannelVolume;

struct OneShotProducer {
    remaining: Option<Memchunk>,
    input: Weak<SinkInput>,
    mainloop: Rc<dyn EventLoop>,
    removal: Option<Rc<DeferEvent>>,
}

impl OneShotProducer {
    /// The input cannot tear itself down from inside a render callback;
    /// hand the job to the next loop turn.
    fn schedule_removal(&mut self) {
        if self.removal.is_some() {
            return;
        }

        let input = self.input.clone();
        self.removal = Some(self.mainloop.defer_new(Box::new(move |e| {
            e.free();
            if let Some(input) = input.upgrade() {
                input.disconnect();
            }
        })));
    }
}

impl SinkInputProducer for OneShotProducer {
    fn peek(&mut self, _input: &Rc<SinkInput>) -> Option<Memchunk> {
        self.remaining.clone()
    }

    fn drop(&mut self, _input: &Rc<SinkInput>, _chunk: &Memchunk, length: usize) {
        let Some(remaining) = &mut self.remaining else {
            return;
        };

        let length = length.min(remaining.length);
        remaining.index += length;
        remaining.length -= length;

        if remaining.length == 0 {
            self.remaining = None;
            self.schedule_removal();
        }
    }
}

/// Plays `chunk` on `sink` once, at the given volume, through a
/// sink-input that removes itself when the data runs out.
pub fn play_memchunk(
    core: &Rc<Core>,
    sink: &Rc<Sink>,
    name: &str,
    spec: &SampleSpec,
    chunk: &Memchunk,
    volume: &ChannelVolume,
) -> Result<(), Error> {
    assert!(chunk.length > 0);

    let input = SinkInput::new(core, sink, name, Some("play-memchunk"), spec, None, false, None)?;
    input.set_volume(volume);

    input.set_producer(Box::new(OneShotProducer {
        remaining: Some(chunk.clone()),
        input: Rc::downgrade(&input),
        mainloop: core.mainloop().clone(),
        removal: None,
    }));

    sink.notify();
    Ok(())
}
