//! Classifier lifecycle: the trained model as a derived, swappable snapshot.
//!
//! Readers clone the published `Arc` and never block on training. Rebuilds
//! are serialized; each one trains from a fresh read of the gallery and then
//! swaps the snapshot in a single write. Refresh requests that arrive while
//! a rebuild is queued are coalesced into one rebuild that covers them all.

use crate::gallery::{Gallery, GalleryError};
use crate::recognizer::{Prediction, Recognizer, Trainer};
use crate::types::{FaceTemplate, MemberId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// One published model state.
pub struct ClassifierSnapshot {
    model: Option<Arc<dyn Recognizer>>,
    generation: u64,
}

impl ClassifierSnapshot {
    fn untrained(generation: u64) -> Self {
        Self {
            model: None,
            generation,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// Incremented on every publish, trained or not.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sample_count(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.sample_count())
    }

    /// Nearest label for `probe`; `None` when untrained.
    pub fn predict(&self, probe: &FaceTemplate) -> Option<Prediction> {
        self.model.as_ref()?.predict(probe)
    }
}

pub struct ClassifierLifecycle {
    trainer: Box<dyn Trainer>,
    published: RwLock<Arc<ClassifierSnapshot>>,
    /// Held for the whole of a rebuild; guards the highest refresh ticket
    /// already covered by a completed rebuild.
    rebuild: Mutex<u64>,
    requested: AtomicU64,
    generation: AtomicU64,
}

impl ClassifierLifecycle {
    pub fn new(trainer: impl Trainer + 'static) -> Self {
        Self {
            trainer: Box::new(trainer),
            published: RwLock::new(Arc::new(ClassifierSnapshot::untrained(0))),
            rebuild: Mutex::new(0),
            requested: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// The currently published snapshot.
    pub fn current(&self) -> Arc<ClassifierSnapshot> {
        match self.published.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Discard the current model and train from exactly `samples`.
    ///
    /// An empty sample set publishes an untrained snapshot.
    pub fn rebuild(&self, samples: Vec<(MemberId, FaceTemplate)>) -> Arc<ClassifierSnapshot> {
        let _guard = self.rebuild.lock().unwrap_or_else(|p| p.into_inner());
        self.train_and_publish(samples)
    }

    /// Retrain from the gallery's current contents.
    ///
    /// Call after every successful gallery mutation. If a rebuild that began
    /// after this call was made has already completed, its snapshot is
    /// returned without training again. On a gallery read failure the
    /// previous model stays published.
    pub fn refresh(&self, gallery: &dyn Gallery) -> Result<Arc<ClassifierSnapshot>, GalleryError> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut covered = self.rebuild.lock().unwrap_or_else(|p| p.into_inner());
        if *covered >= ticket {
            tracing::debug!(ticket, covered = *covered, "refresh coalesced");
            return Ok(self.current());
        }

        // Everything requested up to here is visible to the read below.
        let target = self.requested.load(Ordering::SeqCst);
        let samples = gallery.all_templates()?;
        let snapshot = self.train_and_publish(samples);
        *covered = target;
        Ok(snapshot)
    }

    fn train_and_publish(&self, samples: Vec<(MemberId, FaceTemplate)>) -> Arc<ClassifierSnapshot> {
        let start = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = if samples.is_empty() {
            ClassifierSnapshot::untrained(generation)
        } else {
            ClassifierSnapshot {
                model: Some(self.trainer.train(&samples)),
                generation,
            }
        };
        let snapshot = Arc::new(snapshot);

        match self.published.write() {
            Ok(mut guard) => *guard = Arc::clone(&snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&snapshot),
        }

        tracing::info!(
            generation,
            samples = samples.len(),
            trained = snapshot.is_trained(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "classifier rebuilt"
        );
        snapshot
    }
}
