//! A sine wave generator playing an endless tone into a sink.

use std::cell::Cell;
use std::rc::Rc;

use crate::core::Core;
use crate::error::Error;
use crate::memblock::{Memblock, Memchunk};
use crate::module::{Module, ModuleImpl, ModuleMeta};
use crate::sample::{SampleSpec, SAMPLE_FLOAT32NE};
use crate::sink_input::{SinkInput, SinkInputProducer};

use super::ModArgs;

/// The factory name this module registers under.
pub const NAME: &str = "sine";

const DEFAULT_FREQUENCY: u32 = 440;

/// Serves one precomputed cycle buffer over and over, wrapping at the
/// end.
struct SineProducer {
    memblock: Rc<Memblock>,
    peek_index: Cell<usize>,
    module: Rc<Module>,
}

impl SinkInputProducer for SineProducer {
    fn peek(&mut self, _input: &Rc<SinkInput>) -> Option<Memchunk> {
        let index = self.peek_index.get();
        Some(Memchunk::new(
            self.memblock.share(),
            index,
            self.memblock.len() - index,
        ))
    }

    fn drop(&mut self, _input: &Rc<SinkInput>, _chunk: &Memchunk, length: usize) {
        let mut index = self.peek_index.get() + length;
        if index >= self.memblock.len() {
            index = 0;
        }
        self.peek_index.set(index);
    }

    fn kill(&mut self, input: &Rc<SinkInput>) {
        input.disconnect();
        // The input was the module's only reason to exist.
        self.module.unload_request();
    }
}

struct Sine {
    sink_input: Rc<SinkInput>,
}

impl ModuleImpl for Sine {
    fn teardown(&mut self, _core: &Rc<Core>, _module: &Rc<Module>) {
        self.sink_input.disconnect();
    }
}

fn calc_sine(frequency: u32, rate: u32) -> Vec<u8> {
    let frames = rate as usize;
    (0..frames)
        .map(|i| {
            let phase = i as f64 / frames as f64 * std::f64::consts::TAU * f64::from(frequency);
            (phase.sin() / 2.0) as f32
        })
        .flat_map(f32::to_ne_bytes)
        .collect()
}

fn init(core: &Rc<Core>, module: &Rc<Module>) -> Result<Box<dyn ModuleImpl>, Error> {
    let args = ModArgs::parse(module.argument())?;

    let sink = core
        .lookup_sink(args.get("sink"), true)
        .ok_or_else(|| Error::NoEntity("no such sink".into()))?;

    let spec = SampleSpec::new(SAMPLE_FLOAT32NE, 1, sink.sample_spec().rate)?;

    let frequency = args.get_u32("frequency")?.unwrap_or(DEFAULT_FREQUENCY);
    if frequency < 1 || frequency > spec.rate / 2 {
        return Err(Error::Invalid(format!(
            "invalid frequency {frequency} (must be below the Nyquist rate)"
        )));
    }

    // One second of the tone; the producer loops it.
    let memblock = Memblock::new_dynamic(
        calc_sine(frequency, spec.rate),
        Some(core.memblock_stat()),
    );

    let sink_input = SinkInput::new(
        core,
        &sink,
        &format!("Sine Generator at {frequency} Hz"),
        Some(NAME),
        &spec,
        None,
        false,
        None,
    )?;
    sink_input.set_owner(Some(module));
    sink_input.set_producer(Box::new(SineProducer {
        memblock,
        peek_index: Cell::new(0),
        module: module.clone(),
    }));

    sink.notify();

    Ok(Box::new(Sine { sink_input }))
}

/// Registers the factory on a core.
pub fn register(core: &Rc<Core>) {
    core.register_module_factory(
        NAME,
        ModuleMeta {
            author: None,
            description: Some("Sine wave generator".to_owned()),
            usage: Some("sink=<sink to connect to> frequency=<frequency in Hz>".to_owned()),
            version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        },
        Box::new(init),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use crate::modules::null_sink;
    use pretty_assertions::assert_eq;

    #[test]
    fn plays_a_tone_into_a_sink() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml.clone()));
        null_sink::register(&core);
        register(&core);

        core.load_module(null_sink::NAME, Some("sink_name=out format=s16le rate=8000 channels=1"))
            .unwrap();
        let module = core
            .load_module(NAME, Some("sink=out frequency=200"))
            .unwrap();

        let sink = core.lookup_sink(Some("out"), false).unwrap();
        let chunk = sink.render(1024).expect("the generator has data");

        // A sine at half amplitude has plenty of nonzero samples.
        let nonzero = chunk
            .bytes()
            .chunks_exact(2)
            .filter(|b| i16::from_ne_bytes([b[0], b[1]]) != 0)
            .count();
        assert!(nonzero > 0);

        // Killing the input makes the module request its own unload.
        let input = core.list_sink_inputs().first().cloned().unwrap();
        input.kill();
        ml.iterate(false).unwrap();
        assert_eq!(core.modules.borrow().len(), 1, "only the null sink remains");
        assert!(core.module_by_index(module.index()).is_none());
    }

    #[test]
    fn rejects_silly_frequencies() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        null_sink::register(&core);
        register(&core);

        core.load_module(
            null_sink::NAME,
            Some("sink_name=out format=s16le rate=8000 channels=1"),
        )
        .unwrap();

        assert!(core
            .load_module(NAME, Some("sink=out frequency=100000"))
            .is_err());
    }
}
