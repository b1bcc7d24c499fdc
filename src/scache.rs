//! The sample cache: named PCM clips playable on any sink.
//!
//! Entries are either uploaded by clients as chunks, or registered
//! lazily against a file name and loaded on first play. Loaded data of
//! lazy entries is evicted again after a period of disuse.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::memblock::{MemblockStat, Memchunk};
use crate::module::UNLOAD_POLL_TIME;
use crate::namereg::{NameregKind, NameregValue};
use crate::play_memchunk::play_memchunk;
use crate::sample::SampleSpec;
use crate::sink::Sink;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};
use crate::volume::{ChannelVolume, Volume};

/// Reads a sound file into a chunk. File decoding stays outside the
/// core; embeddings install an implementation with
/// [`Core::set_sound_loader`].
pub trait SoundFileLoader {
    /// Loads `path` entirely into memory.
    fn load(&mut self, path: &Path, stat: &MemblockStat) -> Result<(SampleSpec, Memchunk), Error>;
}

/// One cached clip.
pub struct ScacheEntry {
    index: Cell<u32>,
    name: String,
    sample_spec: Cell<Option<SampleSpec>>,
    chunk: RefCell<Option<Memchunk>>,
    volume: RefCell<ChannelVolume>,
    lazy: Cell<bool>,
    filename: RefCell<Option<PathBuf>>,
    last_used: Cell<Option<Instant>>,
}

impl ScacheEntry {
    /// The entry's index.
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The clip's sample spec, known once data is present.
    pub fn sample_spec(&self) -> Option<SampleSpec> {
        self.sample_spec.get()
    }

    /// The default volume the clip plays at.
    pub fn volume(&self) -> ChannelVolume {
        *self.volume.borrow()
    }

    /// Sets the default volume.
    pub fn set_volume(&self, volume: &ChannelVolume) {
        *self.volume.borrow_mut() = *volume;
    }

    /// Whether this is a lazily loaded file entry.
    pub fn lazy(&self) -> bool {
        self.lazy.get()
    }

    /// The backing file of a lazy entry.
    pub fn filename(&self) -> Option<PathBuf> {
        self.filename.borrow().clone()
    }

    /// Whether clip data is currently in memory.
    pub fn loaded(&self) -> bool {
        self.chunk.borrow().is_some()
    }

    /// The clip data size in bytes, when loaded.
    pub fn length(&self) -> usize {
        self.chunk.borrow().as_ref().map_or(0, |c| c.length)
    }
}

impl Core {
    /// Registers (or reuses) an entry named `name`, with all fields
    /// reset.
    fn scache_add_item(&self, name: &str) -> Result<Rc<ScacheEntry>, Error> {
        if let Some(e) = self.lookup_sample(name) {
            // Replacing an existing clip keeps the name and index.
            e.chunk.borrow_mut().take();
            e.filename.borrow_mut().take();
            e.sample_spec.set(None);
            e.lazy.set(false);
            e.last_used.set(None);
            *e.volume.borrow_mut() = ChannelVolume::norm(2);

            self.subscription_post(
                SubscriptionFacility::SampleCache,
                SubscriptionOperation::Change,
                e.index.get(),
            );
            return Ok(e);
        }

        let entry = Rc::new(ScacheEntry {
            index: Cell::new(INVALID_INDEX),
            name: name.to_owned(),
            sample_spec: Cell::new(None),
            chunk: Default::default(),
            volume: RefCell::new(ChannelVolume::norm(2)),
            lazy: Cell::new(false),
            filename: Default::default(),
            last_used: Cell::new(None),
        });

        // Strict registration: the chosen name is the requested one.
        let chosen = self.namereg_register(
            name,
            NameregKind::Sample,
            NameregValue::Sample(Rc::downgrade(&entry)),
            true,
        )?;
        debug_assert_eq!(chosen, name);

        let index = self.scache.borrow_mut().put(entry.clone());
        entry.index.set(index);

        self.subscription_post(
            SubscriptionFacility::SampleCache,
            SubscriptionOperation::New,
            index,
        );

        Ok(entry)
    }

    /// Adds (or replaces) a clip from an in-memory chunk.
    pub fn scache_add_chunk(
        &self,
        name: &str,
        spec: &SampleSpec,
        chunk: &Memchunk,
    ) -> Result<u32, Error> {
        let entry = self.scache_add_item(name)?;
        entry.sample_spec.set(Some(*spec));
        *entry.chunk.borrow_mut() = Some(chunk.clone());
        Ok(entry.index.get())
    }

    /// Adds (or replaces) a clip by loading `path` immediately.
    pub fn scache_add_file(&self, name: &str, path: &Path) -> Result<u32, Error> {
        let (spec, chunk) = self.sound_file_load(path)?;
        self.scache_add_chunk(name, &spec, &chunk)
    }

    /// Adds (or replaces) a clip that loads `path` on first play.
    pub fn scache_add_file_lazy(self: &Rc<Self>, name: &str, path: &Path) -> Result<u32, Error> {
        let entry = self.scache_add_item(name)?;
        entry.lazy.set(true);
        *entry.filename.borrow_mut() = Some(path.to_owned());

        self.ensure_scache_timer();
        Ok(entry.index.get())
    }

    /// Removes a clip.
    pub fn scache_remove(&self, name: &str) -> Result<(), Error> {
        let entry = self
            .lookup_sample(name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))?;

        self.scache
            .borrow_mut()
            .remove_by(|e| Rc::ptr_eq(e, &entry));
        self.namereg_unregister(NameregKind::Sample, &entry.name);
        self.subscription_post(
            SubscriptionFacility::SampleCache,
            SubscriptionOperation::Remove,
            entry.index.get(),
        );

        Ok(())
    }

    /// Plays a clip on `sink` at `volume` (scaled by the entry's own
    /// volume), loading it first if it is lazy and unloaded.
    pub fn scache_play(
        self: &Rc<Self>,
        name: &str,
        sink: &Rc<Sink>,
        volume: Volume,
    ) -> Result<(), Error> {
        let entry = self
            .lookup_sample(name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))?;

        if entry.lazy.get() && !entry.loaded() {
            let path = entry
                .filename
                .borrow()
                .clone()
                .ok_or_else(|| Error::Internal("lazy entry without a file".into()))?;

            let (spec, chunk) = self.sound_file_load(&path)?;
            entry.sample_spec.set(Some(spec));
            *entry.chunk.borrow_mut() = Some(chunk);

            self.subscription_post(
                SubscriptionFacility::SampleCache,
                SubscriptionOperation::Change,
                entry.index.get(),
            );
        }

        let (spec, chunk) = {
            let chunk = entry.chunk.borrow();
            let chunk = chunk
                .as_ref()
                .ok_or_else(|| Error::NoEntity(format!("sample \"{name}\" has no data")))?;
            let spec = entry
                .sample_spec
                .get()
                .ok_or_else(|| Error::Internal("sample data without a spec".into()))?;
            (spec, chunk.clone())
        };

        let volume = ChannelVolume::uniform(spec.channels, volume).multiply(&entry.volume());
        play_memchunk(self, sink, &format!("sample:{name}"), &spec, &chunk, &volume)?;

        if entry.lazy.get() {
            entry.last_used.set(Some(Instant::now()));
        }

        Ok(())
    }

    /// All cache entries, in insertion order.
    pub fn scache_list(&self) -> Vec<Rc<ScacheEntry>> {
        self.scache.borrow().values().cloned().collect()
    }

    /// Evicts loaded data of lazy entries that have not played for the
    /// configured idle time. Runs periodically; callable directly to
    /// force a sweep.
    pub fn scache_unload_unused(&self) {
        let now = Instant::now();
        let idle = self.scache_idle_time.get();

        let entries: Vec<Rc<ScacheEntry>> = self.scache.borrow().values().cloned().collect();
        for e in entries {
            if !e.lazy.get() || !e.loaded() {
                continue;
            }

            let expired = e.last_used.get().is_none_or(|t| t + idle <= now);
            if !expired {
                continue;
            }

            log::debug!("evicting idle sample \"{}\"", e.name);
            e.chunk.borrow_mut().take();
            self.subscription_post(
                SubscriptionFacility::SampleCache,
                SubscriptionOperation::Change,
                e.index.get(),
            );
        }
    }

    fn ensure_scache_timer(self: &Rc<Self>) {
        let mut slot = self.scache_auto_unload_event.borrow_mut();
        if slot.is_some() {
            return;
        }

        let weak = self.weak_self.clone();
        let e = self.mainloop().time_new(
            Instant::now() + UNLOAD_POLL_TIME,
            Box::new(move |e, _| {
                if let Some(core) = weak.upgrade() {
                    core.scache_unload_unused();
                    e.restart(Instant::now() + UNLOAD_POLL_TIME);
                }
            }),
        );
        *slot = Some(e);
    }

    fn sound_file_load(&self, path: &Path) -> Result<(SampleSpec, Memchunk), Error> {
        let mut loader = self.sound_loader.borrow_mut();
        let loader = loader
            .as_mut()
            .ok_or_else(|| Error::Internal("no sound file loader installed".into()))?;
        loader.load(path, self.memblock_stat())
    }
}
