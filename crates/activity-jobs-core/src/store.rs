use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::{Entity, EntityKind, JobError, RecordMeta, RightsKind, RightsRecord};

pub trait Datastore {
    /// All records of one class, ordered by id.
    ///
    /// # Errors
    /// Returns [`JobError::Store`] when the backing store cannot be read.
    fn scan(&self, kind: EntityKind) -> Result<Vec<Entity>, JobError>;

    /// # Errors
    /// Returns [`JobError::NotFound`] when no record of `kind` has `id`.
    fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Entity, JobError>;

    /// Overwrite an existing record if its stored revision still equals
    /// `entity.meta.revision`, returning the meta now stored with it.
    ///
    /// `last_updated` is only moved when `update_last_updated_time` is set.
    ///
    /// # Errors
    /// Returns [`JobError::Conflict`] when the record changed since it was
    /// read, and [`JobError::NotFound`] when it does not exist.
    fn put(&mut self, entity: &Entity, update_last_updated_time: bool)
        -> Result<RecordMeta, JobError>;

    /// Load the current rights record of `kind` together with its meta.
    ///
    /// # Errors
    /// Propagates [`Datastore::get_by_id`] failures.
    fn get_rights(
        &self,
        kind: RightsKind,
        id: &str,
    ) -> Result<(RecordMeta, RightsRecord), JobError> {
        let entity = self.get_by_id(kind.rights_entity_kind(), id)?;
        match entity.record {
            crate::Record::Rights(rights) => Ok((entity.meta, rights)),
            other => {
                Err(JobError::UnexpectedEntity { expected: "rights record", kind: other.kind() })
            }
        }
    }
}

fn check_revision(stored: &Entity, incoming: &Entity) -> Result<(), JobError> {
    if stored.meta.revision == incoming.meta.revision {
        return Ok(());
    }
    Err(JobError::Conflict {
        kind: incoming.kind(),
        id: incoming.id().to_string(),
        expected: incoming.meta.revision,
        found: stored.meta.revision,
    })
}

/// Datastore held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entities: BTreeMap<(EntityKind, String), Entity>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, replacing any record with the same kind and id.
    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert((entity.kind(), entity.id().to_string()), entity);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Datastore for MemoryStore {
    fn scan(&self, kind: EntityKind) -> Result<Vec<Entity>, JobError> {
        Ok(self
            .entities
            .range((kind, String::new())..)
            .take_while(|((entry_kind, _), _)| *entry_kind == kind)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Entity, JobError> {
        self.entities
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| JobError::NotFound { kind, id: id.to_string() })
    }

    fn put(
        &mut self,
        entity: &Entity,
        update_last_updated_time: bool,
    ) -> Result<RecordMeta, JobError> {
        let key = (entity.kind(), entity.id().to_string());
        let Some(stored) = self.entities.get(&key) else {
            return Err(JobError::NotFound { kind: key.0, id: key.1 });
        };
        check_revision(stored, entity)?;

        let meta = entity.meta.next(update_last_updated_time, OffsetDateTime::now_utc());
        self.entities.insert(key, Entity::new(meta, entity.record.clone()));
        Ok(meta)
    }
}

/// Read-through overlay that keeps writes in memory instead of applying them.
///
/// Reads see earlier overlay writes, so a dry run behaves like the real run
/// without touching the wrapped store.
pub struct DryRunStore<'a> {
    inner: &'a dyn Datastore,
    pending: BTreeMap<(EntityKind, String), Entity>,
}

impl<'a> DryRunStore<'a> {
    #[must_use]
    pub fn new(inner: &'a dyn Datastore) -> Self {
        Self { inner, pending: BTreeMap::new() }
    }

    /// Records that would have been written, in key order.
    #[must_use]
    pub fn pending_writes(&self) -> Vec<&Entity> {
        self.pending.values().collect()
    }
}

impl Datastore for DryRunStore<'_> {
    fn scan(&self, kind: EntityKind) -> Result<Vec<Entity>, JobError> {
        let mut entities = self.inner.scan(kind)?;
        for entity in &mut entities {
            if let Some(pending) = self.pending.get(&(kind, entity.id().to_string())) {
                *entity = pending.clone();
            }
        }
        Ok(entities)
    }

    fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Entity, JobError> {
        if let Some(pending) = self.pending.get(&(kind, id.to_string())) {
            return Ok(pending.clone());
        }
        self.inner.get_by_id(kind, id)
    }

    fn put(
        &mut self,
        entity: &Entity,
        update_last_updated_time: bool,
    ) -> Result<RecordMeta, JobError> {
        let stored = self.get_by_id(entity.kind(), entity.id())?;
        check_revision(&stored, entity)?;

        let meta = entity.meta.next(update_last_updated_time, OffsetDateTime::now_utc());
        self.pending.insert(
            (entity.kind(), entity.id().to_string()),
            Entity::new(meta, entity.record.clone()),
        );
        Ok(meta)
    }
}
