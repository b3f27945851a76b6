//! Identity gallery: enrolled people, their persistence, and the matcher
//! index derived from them.
//!
//! Every mutation persists first and then publishes a freshly built
//! [`MatcherIndex`] before returning, so readers never see storage and
//! matcher out of sync. Readers hold a [`SharedMatcher`] and take a whole
//! index at a time; they see either the pre- or the post-mutation index.

use crate::frame::Frame;
use crate::matcher::{self, MatcherIndex};
use crate::ports::{FaceEmbedder, PortError};
use crate::store::{self, GalleryStore, StoreError};
use crate::types::{Embedding, Identity, MatchResult};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("identity name must not be empty")]
    InvalidName,
    #[error("no face detected in the sample image")]
    NoFaceDetected,
    #[error("{count} faces detected; enrollment needs exactly one")]
    AmbiguousFace { count: usize },
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("face embedder: {0}")]
    Port(PortError),
    #[error("gallery storage: {0}")]
    Storage(#[from] StoreError),
}

impl From<PortError> for GalleryError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::ModelUnavailable(reason) => GalleryError::ModelUnavailable(reason),
            other => GalleryError::Port(other),
        }
    }
}

/// Read side of the gallery's current matcher index.
#[derive(Clone)]
pub struct SharedMatcher {
    rx: watch::Receiver<Option<Arc<MatcherIndex>>>,
}

impl SharedMatcher {
    /// The index as of now; `None` while the gallery is empty.
    pub fn snapshot(&self) -> Option<Arc<MatcherIndex>> {
        self.rx.borrow().clone()
    }

    /// Match one embedding against the current index.
    pub fn resolve(&self, probe: &Embedding) -> MatchResult {
        matcher::resolve(self.snapshot().as_deref(), probe)
    }
}

/// Listing entry for one enrolled identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub embeddings: usize,
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub name: String,
    /// Embedding count for the name after this enrollment.
    pub embeddings: usize,
    /// Whether this enrollment created the identity.
    pub created: bool,
}

pub struct Gallery {
    identities: Vec<Identity>,
    store: Box<dyn GalleryStore>,
    threshold: f32,
    matcher_tx: watch::Sender<Option<Arc<MatcherIndex>>>,
}

impl Gallery {
    /// Load from `store` (empty on missing/corrupt) and build the index.
    pub fn open(store: Box<dyn GalleryStore>, threshold: f32) -> Self {
        let identities = store::load_or_empty(store.as_ref());
        let index = MatcherIndex::build(&identities, threshold).map(Arc::new);
        let (matcher_tx, _rx) = watch::channel(index);
        Self {
            identities,
            store,
            threshold,
            matcher_tx,
        }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn summaries(&self) -> Vec<IdentitySummary> {
        self.identities
            .iter()
            .map(|i| IdentitySummary {
                name: i.name.clone(),
                embeddings: i.embeddings.len(),
            })
            .collect()
    }

    /// Number of embeddings enrolled under `name` (0 if absent).
    pub fn embedding_count(&self, name: &str) -> usize {
        self.identities
            .iter()
            .find(|i| i.name == name.trim())
            .map_or(0, |i| i.embeddings.len())
    }

    pub fn matcher(&self) -> SharedMatcher {
        SharedMatcher {
            rx: self.matcher_tx.subscribe(),
        }
    }

    /// Enroll one face from a still sample.
    ///
    /// Runs the embedder once over `sample`; exactly one face must be found.
    /// On any error the gallery is unchanged.
    pub async fn enroll(
        &mut self,
        name: &str,
        sample: &Frame,
        embedder: &dyn FaceEmbedder,
    ) -> Result<Enrollment, GalleryError> {
        let name = normalize_name(name)?;

        let mut faces = embedder.detect_faces(sample).await?;
        let face = match faces.len() {
            0 => return Err(GalleryError::NoFaceDetected),
            1 => faces.remove(0),
            count => return Err(GalleryError::AmbiguousFace { count }),
        };

        tracing::debug!(
            name = %name,
            confidence = face.confidence,
            dim = face.embedding.len(),
            "enroll: face embedded"
        );

        self.add_embedding(&name, face.embedding)
    }

    /// Append an embedding under `name`, creating the identity if needed.
    pub fn add_embedding(
        &mut self,
        name: &str,
        embedding: Embedding,
    ) -> Result<Enrollment, GalleryError> {
        let name = normalize_name(name)?;

        let mut next = self.identities.clone();
        let created = match next.iter_mut().find(|i| i.name == name) {
            Some(existing) => {
                existing.embeddings.push(embedding);
                false
            }
            None => {
                next.push(Identity {
                    name: name.clone(),
                    embeddings: vec![embedding],
                });
                true
            }
        };

        self.commit(next)?;

        let embeddings = self.embedding_count(&name);
        tracing::info!(name = %name, embeddings, created, "identity enrolled");
        Ok(Enrollment {
            name,
            embeddings,
            created,
        })
    }

    /// Delete an identity and all its embeddings. Returns `false` if absent.
    pub fn remove(&mut self, name: &str) -> Result<bool, GalleryError> {
        let name = name.trim();
        if !self.identities.iter().any(|i| i.name == name) {
            return Ok(false);
        }

        let next: Vec<Identity> = self
            .identities
            .iter()
            .filter(|i| i.name != name)
            .cloned()
            .collect();
        self.commit(next)?;

        tracing::info!(name, remaining = self.identities.len(), "identity removed");
        Ok(true)
    }

    /// Persist `next`, adopt it, and publish its index.
    fn commit(&mut self, next: Vec<Identity>) -> Result<(), GalleryError> {
        self.store.save(&next)?;
        let index = MatcherIndex::build(&next, self.threshold).map(Arc::new);
        self.identities = next;
        self.matcher_tx.send_replace(index);
        Ok(())
    }
}

fn normalize_name(name: &str) -> Result<String, GalleryError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GalleryError::InvalidName);
    }
    Ok(name.to_string())
}
