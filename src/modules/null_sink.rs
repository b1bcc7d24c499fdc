//! A clocked sink that discards everything rendered to it.
//!
//! Useful as a fallback device, as the target of autoload rules in
//! setups without hardware, and as the reference for how a module drives
//! a sink: a timer paces render calls at the configured sample rate and
//! throws the mixed data away.

use std::rc::Rc;
use std::time::Instant;

use crate::core::Core;
use crate::error::Error;
use crate::mainloop::TimeEvent;
use crate::module::{Module, ModuleImpl, ModuleMeta};
use crate::sample::{SampleFormat, SampleSpec};
use crate::sink::Sink;

use super::ModArgs;

/// The factory name this module registers under.
pub const NAME: &str = "null-sink";

const DEFAULT_SINK_NAME: &str = "null";

struct NullSink {
    sink: Rc<Sink>,
    time_event: Rc<TimeEvent>,
}

impl ModuleImpl for NullSink {
    fn teardown(&mut self, _core: &Rc<Core>, _module: &Rc<Module>) {
        self.time_event.free();
        self.sink.disconnect();
    }
}

fn init(core: &Rc<Core>, module: &Rc<Module>) -> Result<Box<dyn ModuleImpl>, Error> {
    let args = ModArgs::parse(module.argument())?;

    let mut spec = core.default_sample_spec();
    if let Some(format) = args.get("format") {
        spec.format = SampleFormat::parse(format)
            .ok_or_else(|| Error::Invalid(format!("unknown sample format \"{format}\"")))?;
    }
    if let Some(rate) = args.get_u32("rate")? {
        spec.rate = rate;
    }
    if let Some(channels) = args.get_u32("channels")? {
        spec.channels = channels
            .try_into()
            .map_err(|_| Error::Invalid("channel count out of range".into()))?;
    }
    let spec = SampleSpec::new(spec.format, spec.channels, spec.rate)?;

    let sink = Sink::new(
        core,
        args.get("sink_name").unwrap_or(DEFAULT_SINK_NAME),
        Some(NAME),
        false,
        &spec,
        None,
    )?;
    sink.set_owner(Some(module));
    sink.set_description(Some("NULL sink"));

    // Render a tenth of a second at a time, clocked by how much the last
    // round produced.
    let block_size = spec.bytes_per_second() / 10;
    let timer_sink = sink.clone();
    let time_event = core.mainloop().time_new(
        Instant::now(),
        Box::new(move |e, _| {
            let consumed = match timer_sink.render(block_size) {
                Some(chunk) => chunk.length,
                None => block_size,
            };

            e.restart(Instant::now() + timer_sink.sample_spec().bytes_to_duration(consumed));
        }),
    );

    Ok(Box::new(NullSink { sink, time_event }))
}

/// Registers the factory on a core.
pub fn register(core: &Rc<Core>) {
    core.register_module_factory(
        NAME,
        ModuleMeta {
            author: None,
            description: Some("Clocked NULL sink".to_owned()),
            usage: Some(
                "format=<sample format> channels=<number of channels> rate=<sample rate> sink_name=<name of sink>"
                    .to_owned(),
            ),
            version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        },
        Box::new(init),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use pretty_assertions::assert_eq;

    #[test]
    fn loads_and_registers_a_sink() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml.clone()));
        register(&core);

        let module = core
            .load_module(NAME, Some("sink_name=quiet rate=8000 channels=1"))
            .unwrap();

        let sink = core.lookup_sink(Some("quiet"), false).expect("sink exists");
        assert_eq!(sink.sample_spec().rate, 8000);
        assert_eq!(sink.sample_spec().channels, 1);
        assert!(sink.owner().is_some());

        // The monitor came along for the ride.
        assert!(core.lookup_source(Some("quiet_monitor"), false).is_some());

        core.unload_module(&module);
        assert!(core.lookup_sink(Some("quiet"), false).is_none());
        assert!(core.lookup_source(Some("quiet_monitor"), false).is_none());
    }
}
