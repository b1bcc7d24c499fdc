//! The transport-agnostic command surface.
//!
//! Every wire protocol ultimately maps its opcodes onto this set of
//! operations against the core. The connectionless operations (discovery,
//! volume, kills, modules, samples, autoload, defaults) go through
//! [`dispatch`]; stream lifecycle and stream control bind directly to
//! [`crate::stream`], and change notification to [`Core::subscribe`],
//! since both need per-connection state.

use std::rc::Rc;

use crate::channel_map::ChannelMap;
use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::namereg::NameregKind;
use crate::resampler::ResampleMethod;
use crate::sample::SampleSpec;
use crate::sink::MixerMode;
use crate::volume::{ChannelVolume, Volume};

/// Addresses an entity by index or registered name.
#[derive(Debug, Clone)]
pub enum Target {
    /// A `u32` index from an indexed set.
    Index(u32),
    /// A registered name.
    Name(String),
}

/// An operation a client can ask the core to perform.
#[derive(Debug)]
pub enum Command {
    GetServerInfo,
    Stat,

    GetSinkInfo(Target),
    GetSinkInfoList,
    GetSourceInfo(Target),
    GetSourceInfoList,
    GetSinkInputInfo(u32),
    GetSinkInputInfoList,
    GetSourceOutputInfo(u32),
    GetSourceOutputInfoList,
    GetClientInfo(u32),
    GetClientInfoList,
    GetModuleInfo(u32),
    GetModuleInfoList,
    GetSampleInfo(Target),
    GetSampleInfoList,
    GetAutoloadInfo {
        name: String,
        kind: NameregKind,
    },
    GetAutoloadInfoList,

    AddAutoload {
        name: String,
        kind: NameregKind,
        module: String,
        argument: Option<String>,
    },
    RemoveAutoload {
        name: String,
        kind: NameregKind,
    },

    PlaySample {
        name: String,
        /// `None` plays on the default sink.
        sink: Option<Target>,
        volume: Volume,
    },
    RemoveSample(String),

    SetSinkVolume {
        target: Target,
        volume: ChannelVolume,
    },
    SetSinkInputVolume {
        index: u32,
        volume: ChannelVolume,
    },

    SetDefaultSink(Option<String>),
    SetDefaultSource(Option<String>),

    KillClient(u32),
    KillSinkInput(u32),
    KillSourceOutput(u32),

    LoadModule {
        name: String,
        argument: Option<String>,
    },
    UnloadModule(u32),
}

/// Server-wide facts for a server-info reply.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_name: String,
    pub server_version: String,
    pub user_name: String,
    pub host_name: String,
    pub default_sample_spec: SampleSpec,
    pub default_sink_name: Option<String>,
    pub default_source_name: Option<String>,
}

/// Memory accounting for a stat reply.
#[derive(Debug, Clone, Copy)]
pub struct StatInfo {
    /// Blocks currently allocated.
    pub memblock_total: u32,
    /// Bytes currently allocated.
    pub memblock_total_size: usize,
    /// Blocks ever allocated.
    pub memblock_allocated: u32,
    /// Bytes ever allocated.
    pub memblock_allocated_size: usize,
    /// Bytes held by the sample cache.
    pub scache_size: usize,
}

#[derive(Debug, Clone)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub owner_module: Option<u32>,
    pub volume: ChannelVolume,
    pub monitor_source: Option<u32>,
    pub latency: std::time::Duration,
    pub driver: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub owner_module: Option<u32>,
    pub monitor_of_sink: Option<u32>,
    pub latency: std::time::Duration,
    pub driver: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SinkInputInfo {
    pub index: u32,
    pub name: String,
    pub owner_module: Option<u32>,
    pub client: Option<u32>,
    pub sink: Option<u32>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub volume: ChannelVolume,
    pub latency: std::time::Duration,
    pub resample_method: Option<ResampleMethod>,
    pub driver: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceOutputInfo {
    pub index: u32,
    pub name: String,
    pub owner_module: Option<u32>,
    pub client: Option<u32>,
    pub source: Option<u32>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub latency: std::time::Duration,
    pub resample_method: Option<ResampleMethod>,
    pub driver: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub index: u32,
    pub name: String,
    pub owner_module: Option<u32>,
    pub protocol_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub index: u32,
    pub name: String,
    pub argument: Option<String>,
    pub used: Option<u32>,
    pub auto_unload: bool,
    pub description: Option<String>,
    pub author: Option<String>,
    pub usage: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SampleInfo {
    pub index: u32,
    pub name: String,
    pub volume: ChannelVolume,
    pub sample_spec: Option<SampleSpec>,
    pub length: usize,
    pub lazy: bool,
    pub filename: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AutoloadInfo {
    pub index: u32,
    pub name: String,
    pub kind: NameregKind,
    pub module: String,
    pub argument: Option<String>,
}

/// The result of a successfully dispatched command.
#[derive(Debug)]
pub enum Reply {
    /// Plain acknowledgement.
    Ack,
    /// An index assigned or resolved by the command.
    Index(u32),
    ServerInfo(ServerInfo),
    Stat(StatInfo),
    SinkInfo(Box<SinkInfo>),
    SinkInfoList(Vec<SinkInfo>),
    SourceInfo(Box<SourceInfo>),
    SourceInfoList(Vec<SourceInfo>),
    SinkInputInfo(Box<SinkInputInfo>),
    SinkInputInfoList(Vec<SinkInputInfo>),
    SourceOutputInfo(Box<SourceOutputInfo>),
    SourceOutputInfoList(Vec<SourceOutputInfo>),
    ClientInfo(Box<ClientInfo>),
    ClientInfoList(Vec<ClientInfo>),
    ModuleInfo(Box<ModuleInfo>),
    ModuleInfoList(Vec<ModuleInfo>),
    SampleInfo(Box<SampleInfo>),
    SampleInfoList(Vec<SampleInfo>),
    AutoloadInfo(Box<AutoloadInfo>),
    AutoloadInfoList(Vec<AutoloadInfo>),
}

fn sink_info(sink: &Rc<crate::sink::Sink>) -> SinkInfo {
    SinkInfo {
        index: sink.index(),
        name: sink.name(),
        description: sink.description(),
        sample_spec: *sink.sample_spec(),
        channel_map: *sink.channel_map(),
        owner_module: sink.owner().map(|m| m.index()),
        volume: sink.volume(MixerMode::Auto),
        monitor_source: sink.monitor_source().map(|s| s.index()),
        latency: sink.latency(),
        driver: sink.driver().map(str::to_owned),
    }
}

fn source_info(source: &Rc<crate::source::Source>) -> SourceInfo {
    SourceInfo {
        index: source.index(),
        name: source.name(),
        description: source.description(),
        sample_spec: *source.sample_spec(),
        channel_map: *source.channel_map(),
        owner_module: source.owner().map(|m| m.index()),
        monitor_of_sink: source.monitor_of().map(|s| s.index()),
        latency: source.latency(),
        driver: source.driver().map(str::to_owned),
    }
}

fn sink_input_info(input: &Rc<crate::sink_input::SinkInput>) -> SinkInputInfo {
    SinkInputInfo {
        index: input.index(),
        name: input.name(),
        owner_module: input.owner().map(|m| m.index()),
        client: input.client().map(|c| c.index()),
        sink: input.sink().map(|s| s.index()),
        sample_spec: input.sample_spec(),
        channel_map: *input.channel_map(),
        volume: input.volume(),
        latency: input.latency(),
        resample_method: input.resample_method(),
        driver: input.driver().map(str::to_owned),
    }
}

fn source_output_info(output: &Rc<crate::source_output::SourceOutput>) -> SourceOutputInfo {
    SourceOutputInfo {
        index: output.index(),
        name: output.name(),
        owner_module: output.owner().map(|m| m.index()),
        client: output.client().map(|c| c.index()),
        source: output.source().map(|s| s.index()),
        sample_spec: *output.sample_spec(),
        channel_map: *output.channel_map(),
        latency: output.latency(),
        resample_method: output.resample_method(),
        driver: output.driver().map(str::to_owned),
    }
}

fn client_info(client: &Rc<crate::client::Client>) -> ClientInfo {
    ClientInfo {
        index: client.index(),
        name: client.name(),
        owner_module: client.owner().map(|m| m.index()),
        protocol_name: client.protocol_name().map(str::to_owned),
    }
}

fn module_info(module: &Rc<crate::module::Module>) -> ModuleInfo {
    let meta = module.meta();
    ModuleInfo {
        index: module.index(),
        name: module.name().to_owned(),
        argument: module.argument().map(str::to_owned),
        used: module.used(),
        auto_unload: module.auto_unload(),
        description: meta.description.clone(),
        author: meta.author.clone(),
        usage: meta.usage.clone(),
        version: meta.version.clone(),
    }
}

fn sample_info(entry: &Rc<crate::scache::ScacheEntry>) -> SampleInfo {
    SampleInfo {
        index: entry.index(),
        name: entry.name().to_owned(),
        volume: entry.volume(),
        sample_spec: entry.sample_spec(),
        length: entry.length(),
        lazy: entry.lazy(),
        filename: entry.filename(),
    }
}

fn autoload_info(entry: &Rc<crate::autoload::AutoloadEntry>) -> AutoloadInfo {
    AutoloadInfo {
        index: entry.index(),
        name: entry.name().to_owned(),
        kind: entry.kind(),
        module: entry.module().to_owned(),
        argument: entry.argument().map(str::to_owned),
    }
}

fn resolve_sink(core: &Rc<Core>, target: &Target) -> Result<Rc<crate::sink::Sink>, Error> {
    let found = match target {
        Target::Index(index) => core.sinks.borrow().get(*index).cloned(),
        Target::Name(name) => core.lookup_sink(Some(name), false),
    };

    found.ok_or_else(|| Error::NoEntity(format!("{target:?}")))
}

fn resolve_source(core: &Rc<Core>, target: &Target) -> Result<Rc<crate::source::Source>, Error> {
    let found = match target {
        Target::Index(index) => core.sources.borrow().get(*index).cloned(),
        Target::Name(name) => core.lookup_source(Some(name), false),
    };

    found.ok_or_else(|| Error::NoEntity(format!("{target:?}")))
}

/// Executes one command against the core.
pub fn dispatch(core: &Rc<Core>, command: Command) -> Result<Reply, Error> {
    match command {
        Command::GetServerInfo => Ok(Reply::ServerInfo(ServerInfo {
            server_name: env!("CARGO_PKG_NAME").to_owned(),
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            user_name: std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned()),
            host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            default_sample_spec: core.default_sample_spec(),
            default_sink_name: core.default_sink_name(),
            default_source_name: core.default_source_name(),
        })),

        Command::Stat => {
            let stat = core.memblock_stat();
            let scache_size = core.scache_list().iter().map(|e| e.length()).sum();
            Ok(Reply::Stat(StatInfo {
                memblock_total: stat.total(),
                memblock_total_size: stat.total_size(),
                memblock_allocated: stat.allocated(),
                memblock_allocated_size: stat.allocated_size(),
                scache_size,
            }))
        }

        Command::GetSinkInfo(target) => {
            let sink = resolve_sink(core, &target)?;
            Ok(Reply::SinkInfo(Box::new(sink_info(&sink))))
        }
        Command::GetSinkInfoList => {
            let sinks: Vec<_> = core.sinks.borrow().values().cloned().collect();
            Ok(Reply::SinkInfoList(sinks.iter().map(sink_info).collect()))
        }

        Command::GetSourceInfo(target) => {
            let source = resolve_source(core, &target)?;
            Ok(Reply::SourceInfo(Box::new(source_info(&source))))
        }
        Command::GetSourceInfoList => {
            let sources: Vec<_> = core.sources.borrow().values().cloned().collect();
            Ok(Reply::SourceInfoList(
                sources.iter().map(source_info).collect(),
            ))
        }

        Command::GetSinkInputInfo(index) => {
            let input = core
                .sink_inputs
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("sink input #{index}")))?;
            Ok(Reply::SinkInputInfo(Box::new(sink_input_info(&input))))
        }
        Command::GetSinkInputInfoList => {
            let inputs: Vec<_> = core.sink_inputs.borrow().values().cloned().collect();
            Ok(Reply::SinkInputInfoList(
                inputs.iter().map(sink_input_info).collect(),
            ))
        }

        Command::GetSourceOutputInfo(index) => {
            let output = core
                .source_outputs
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("source output #{index}")))?;
            Ok(Reply::SourceOutputInfo(Box::new(source_output_info(
                &output,
            ))))
        }
        Command::GetSourceOutputInfoList => {
            let outputs: Vec<_> = core.source_outputs.borrow().values().cloned().collect();
            Ok(Reply::SourceOutputInfoList(
                outputs.iter().map(source_output_info).collect(),
            ))
        }

        Command::GetClientInfo(index) => {
            let client = core
                .clients
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("client #{index}")))?;
            Ok(Reply::ClientInfo(Box::new(client_info(&client))))
        }
        Command::GetClientInfoList => {
            let clients: Vec<_> = core.clients.borrow().values().cloned().collect();
            Ok(Reply::ClientInfoList(
                clients.iter().map(client_info).collect(),
            ))
        }

        Command::GetModuleInfo(index) => {
            let module = core
                .module_by_index(index)
                .ok_or_else(|| Error::NoEntity(format!("module #{index}")))?;
            Ok(Reply::ModuleInfo(Box::new(module_info(&module))))
        }
        Command::GetModuleInfoList => {
            let modules: Vec<_> = core.modules.borrow().values().cloned().collect();
            Ok(Reply::ModuleInfoList(
                modules.iter().map(module_info).collect(),
            ))
        }

        Command::GetSampleInfo(target) => {
            let entry = match &target {
                Target::Index(index) => core.scache.borrow().get(*index).cloned(),
                Target::Name(name) => core.lookup_sample(name),
            }
            .ok_or_else(|| Error::NoEntity(format!("{target:?}")))?;
            Ok(Reply::SampleInfo(Box::new(sample_info(&entry))))
        }
        Command::GetSampleInfoList => Ok(Reply::SampleInfoList(
            core.scache_list().iter().map(sample_info).collect(),
        )),

        Command::GetAutoloadInfo { name, kind } => {
            let entry = core
                .autoload_get(&name, kind)
                .ok_or_else(|| Error::NoEntity(name))?;
            Ok(Reply::AutoloadInfo(Box::new(autoload_info(&entry))))
        }
        Command::GetAutoloadInfoList => Ok(Reply::AutoloadInfoList(
            core.autoload_list().iter().map(autoload_info).collect(),
        )),

        Command::AddAutoload {
            name,
            kind,
            module,
            argument,
        } => {
            let index = core.autoload_add(&name, kind, &module, argument.as_deref())?;
            Ok(Reply::Index(index))
        }
        Command::RemoveAutoload { name, kind } => {
            core.autoload_remove(&name, kind)?;
            Ok(Reply::Ack)
        }

        Command::PlaySample { name, sink, volume } => {
            let sink = match &sink {
                Some(target) => resolve_sink(core, target)?,
                None => core
                    .lookup_sink(None, true)
                    .ok_or_else(|| Error::NoEntity("default sink".into()))?,
            };

            core.scache_play(&name, &sink, volume)?;
            Ok(Reply::Ack)
        }
        Command::RemoveSample(name) => {
            core.scache_remove(&name)?;
            Ok(Reply::Ack)
        }

        Command::SetSinkVolume { target, volume } => {
            let sink = resolve_sink(core, &target)?;
            sink.set_volume(MixerMode::Auto, &volume);
            Ok(Reply::Ack)
        }
        Command::SetSinkInputVolume { index, volume } => {
            let input = core
                .sink_inputs
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("sink input #{index}")))?;
            input.set_volume(&volume);
            Ok(Reply::Ack)
        }

        Command::SetDefaultSink(name) => {
            core.set_default_sink_name(name.as_deref());
            Ok(Reply::Ack)
        }
        Command::SetDefaultSource(name) => {
            core.set_default_source_name(name.as_deref());
            Ok(Reply::Ack)
        }

        Command::KillClient(index) => {
            let client = core
                .clients
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("client #{index}")))?;
            client.kill();
            Ok(Reply::Ack)
        }
        Command::KillSinkInput(index) => {
            let input = core
                .sink_inputs
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("sink input #{index}")))?;
            input.kill();
            Ok(Reply::Ack)
        }
        Command::KillSourceOutput(index) => {
            let output = core
                .source_outputs
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::NoEntity(format!("source output #{index}")))?;
            output.kill();
            Ok(Reply::Ack)
        }

        Command::LoadModule { name, argument } => {
            let module = core.load_module(&name, argument.as_deref())?;
            Ok(Reply::Index(module.index()))
        }
        Command::UnloadModule(index) => {
            if index == INVALID_INDEX {
                return Err(Error::Invalid("invalid module index".into()));
            }
            core.unload_module_by_index(index)?;
            Ok(Reply::Ack)
        }
    }
}
