//! A user-space sound server core, suitable for building mixing daemons
//! and the protocol frontends that feed them.
//!
//! The crate provides the audio plumbing engine: refcounted memory
//! blocks and zero-copy chunks ([`memblock`]), the per-stream queue with
//! prebuffer and target-fill semantics ([`memblockq`]), format/channel/
//! rate conversion ([`resampler`]), sink mixing and rendering with an
//! implicit monitor tap ([`sink`], [`source`]), the client endpoint
//! adapters ([`sink_input`], [`source_output`], [`stream`]), the
//! single-threaded cooperative event loop driving all of it
//! ([`mainloop`]), and the deferred publish/subscribe bus that tells
//! clients what changed ([`subscribe`]).
//!
//! Everything hangs off a [`core::Core`] instance; hardware and protocol
//! integrations plug in as modules ([`module`], [`modules`]).

#![warn(
    anonymous_parameters,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

pub mod autoload;
pub mod channel_map;
pub mod client;
pub mod command;
pub mod core;
pub mod error;
pub mod idxset;
pub mod mainloop;
pub mod memblock;
pub mod memblockq;
pub mod module;
pub mod modules;
pub mod namereg;
pub mod play_memchunk;
pub mod resampler;
pub mod sample;
pub mod sample_util;
pub mod scache;
pub mod sconv;
pub mod sink;
pub mod sink_input;
pub mod source;
pub mod source_output;
pub mod stream;
pub mod subscribe;
pub mod volume;

pub use crate::core::Core;
pub use crate::error::{Error, ErrorCode};
pub use crate::mainloop::Mainloop;
pub use crate::memblock::{Memblock, MemblockStat, Memchunk};
pub use crate::sample::{SampleFormat, SampleSpec};
pub use crate::volume::{ChannelVolume, Volume};
