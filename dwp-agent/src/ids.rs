// Entity ID registry
//
// Hands out small integer IDs for runtime entities. IDs are scoped to the
// domain that owns the entity and fail with UNLOADED once it is gone. Objects
// are held weakly unless pinned while the VM is suspended.

use crate::agent::Agent;
use crate::host::RuntimeObject;
use crate::protocol::{ErrorCode, ProtocolVersion};
use crate::types::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdKind {
    Assembly = 0,
    Module = 1,
    Type = 2,
    Method = 3,
    Field = 4,
    Domain = 5,
    Property = 6,
    Parameter = 7,
}

const ID_KINDS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct IdEntry {
    handle: u64,
    domain: DomainRef,
}

#[derive(Debug, Default)]
struct IdTable {
    entries: Vec<IdEntry>,
    by_handle: HashMap<(DomainRef, u64), EntityId>,
}

#[derive(Debug)]
struct ObjectEntry {
    object: Weak<dyn RuntimeObject>,
    domain: DomainRef,
}

#[derive(Debug)]
pub struct EntityIds {
    tables: [IdTable; ID_KINDS],
    unloaded: HashSet<DomainRef>,
    objects: HashMap<ObjectId, ObjectEntry>,
    object_ids: HashMap<u64, ObjectId>,
    next_object_id: ObjectId,
    pinned: HashMap<ObjectId, Arc<dyn RuntimeObject>>,
}

impl Default for EntityIds {
    fn default() -> Self {
        Self {
            tables: std::array::from_fn(|_| IdTable::default()),
            unloaded: HashSet::new(),
            objects: HashMap::new(),
            object_ids: HashMap::new(),
            next_object_id: 1,
            pinned: HashMap::new(),
        }
    }
}

impl EntityIds {
    /// ID for `handle` in `domain`, minted on first use
    pub fn get_id(&mut self, kind: IdKind, domain: DomainRef, handle: u64) -> EntityId {
        let table = &mut self.tables[kind as usize];
        if let Some(id) = table.by_handle.get(&(domain, handle)) {
            return *id;
        }

        table.entries.push(IdEntry { handle, domain });
        let id = table.entries.len() as EntityId;
        table.by_handle.insert((domain, handle), id);
        trace!("New {:?} id {} for {:#x}", kind, id, handle);
        id
    }

    /// Handle and owning domain behind an ID
    pub fn resolve(&self, kind: IdKind, id: EntityId) -> Result<(u64, DomainRef), ErrorCode> {
        let table = &self.tables[kind as usize];
        if id <= 0 || id as usize > table.entries.len() {
            return Err(ErrorCode::InvalidObject);
        }

        let entry = table.entries[id as usize - 1];
        if self.unloaded.contains(&entry.domain) {
            return Err(ErrorCode::Unloaded);
        }
        Ok((entry.handle, entry.domain))
    }

    /// Forget everything owned by `domain`; its IDs now resolve to UNLOADED
    pub fn domain_unloaded(&mut self, domain: DomainRef) {
        self.unloaded.insert(domain);
        for table in self.tables.iter_mut() {
            table.by_handle.retain(|(d, _), _| *d != domain);
        }
        self.pinned
            .retain(|_, obj| obj.domain() != domain);
    }

    pub fn is_unloaded(&self, domain: DomainRef) -> bool {
        self.unloaded.contains(&domain)
    }

    /// Object ID for `object`, reusing the existing one while it is alive
    pub fn object_id(&mut self, object: &Arc<dyn RuntimeObject>, pin: bool) -> ObjectId {
        let address = object.address();
        let id = match self.object_ids.get(&address) {
            Some(id) if self.is_same_object(*id, object) => *id,
            _ => {
                let id = self.next_object_id;
                self.next_object_id += 1;
                self.objects.insert(
                    id,
                    ObjectEntry {
                        object: Arc::downgrade(object),
                        domain: object.domain(),
                    },
                );
                self.object_ids.insert(address, id);
                id
            }
        };

        if pin {
            self.pin(id, object);
        }
        id
    }

    fn is_same_object(&self, id: ObjectId, object: &Arc<dyn RuntimeObject>) -> bool {
        self.objects
            .get(&id)
            .and_then(|e| e.object.upgrade())
            .map(|o| Arc::ptr_eq(&o, object))
            .unwrap_or(false)
    }

    /// Look up an object, pinning it if the VM is suspended
    pub fn object(&mut self, id: ObjectId, pin: bool) -> Result<Arc<dyn RuntimeObject>, ErrorCode> {
        let entry = self.objects.get(&id).ok_or(ErrorCode::InvalidObject)?;
        if self.unloaded.contains(&entry.domain) {
            return Err(ErrorCode::Unloaded);
        }

        let object = entry.object.upgrade().ok_or(ErrorCode::InvalidObject)?;
        if pin {
            self.pin(id, &object);
        }
        Ok(object)
    }

    /// Keep `object` alive until the VM resumes
    fn pin(&mut self, id: ObjectId, object: &Arc<dyn RuntimeObject>) {
        self.pinned.entry(id).or_insert_with(|| Arc::clone(object));
    }

    /// The VM is running again: release the pins and forget whatever was
    /// collected meanwhile
    pub fn vm_resumed(&mut self) {
        self.clear_pins();
        self.sweep();
    }

    /// Drop every pin taken during the last suspension
    fn clear_pins(&mut self) {
        if !self.pinned.is_empty() {
            trace!("Releasing {} pinned objects", self.pinned.len());
        }
        self.pinned.clear();
    }

    #[cfg(test)]
    fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    /// Drop table entries whose objects have been collected
    fn sweep(&mut self) {
        let dead: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, e)| e.object.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        if !dead.is_empty() {
            trace!("Forgetting {} collected objects", dead.len());
        }
        for id in dead {
            self.objects.remove(&id);
        }
        let objects = &self.objects;
        self.object_ids.retain(|_, id| objects.contains_key(id));
    }
}

/// ID access for code running outside the registry lock, such as host
/// command handlers
pub struct Entities<'a> {
    agent: &'a Agent,
}

impl<'a> Entities<'a> {
    pub(crate) fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.agent.protocol_version()
    }

    pub fn id(&self, kind: IdKind, domain: DomainRef, handle: u64) -> EntityId {
        self.agent.registry.lock().ids.get_id(kind, domain, handle)
    }

    pub fn resolve(&self, kind: IdKind, id: EntityId) -> Result<(u64, DomainRef), ErrorCode> {
        self.agent.registry.lock().ids.resolve(kind, id)
    }

    pub fn method_id(&self, domain: DomainRef, method: MethodRef) -> EntityId {
        self.id(IdKind::Method, domain, method.0)
    }

    pub fn method(&self, id: EntityId) -> Result<MethodRef, ErrorCode> {
        self.resolve(IdKind::Method, id).map(|(h, _)| MethodRef(h))
    }

    pub fn type_id(&self, domain: DomainRef, ty: TypeRef) -> EntityId {
        self.id(IdKind::Type, domain, ty.0)
    }

    pub fn object_id(&self, object: &Arc<dyn RuntimeObject>) -> ObjectId {
        let pin = self.agent.coordinator.is_suspending();
        self.agent.registry.lock().ids.object_id(object, pin)
    }

    pub fn object(&self, id: ObjectId) -> Result<Arc<dyn RuntimeObject>, ErrorCode> {
        let pin = self.agent.coordinator.is_suspending();
        self.agent.registry.lock().ids.object(id, pin)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug)]
    struct Obj {
        address: u64,
        domain: DomainRef,
    }

    impl RuntimeObject for Obj {
        fn address(&self) -> u64 {
            self.address
        }
        fn domain(&self) -> DomainRef {
            self.domain
        }
        fn class(&self) -> TypeRef {
            TypeRef(1)
        }
    }

    pub(crate) fn obj(address: u64, domain: u64) -> Arc<dyn RuntimeObject> {
        Arc::new(Obj { address, domain: DomainRef(domain) })
    }

    #[test]
    fn test_ids_are_stable_per_domain() {
        let mut ids = EntityIds::default();
        let a = ids.get_id(IdKind::Method, DomainRef(1), 0x10);
        let b = ids.get_id(IdKind::Method, DomainRef(1), 0x20);
        assert_eq!(ids.get_id(IdKind::Method, DomainRef(1), 0x10), a);
        assert_ne!(a, b);

        // Same handle in another domain is a different entity
        let c = ids.get_id(IdKind::Method, DomainRef(2), 0x10);
        assert_ne!(a, c);

        assert_eq!(ids.resolve(IdKind::Method, b), Ok((0x20, DomainRef(1))));
        assert_eq!(ids.resolve(IdKind::Method, 0), Err(ErrorCode::InvalidObject));
        assert_eq!(ids.resolve(IdKind::Method, 99), Err(ErrorCode::InvalidObject));
        assert_eq!(ids.resolve(IdKind::Type, a), Err(ErrorCode::InvalidObject));
    }

    #[test]
    fn test_unloaded_domain() {
        let mut ids = EntityIds::default();
        let id = ids.get_id(IdKind::Type, DomainRef(3), 7);
        let o = obj(0x100, 3);
        let oid = ids.object_id(&o, false);

        ids.domain_unloaded(DomainRef(3));
        assert_eq!(ids.resolve(IdKind::Type, id), Err(ErrorCode::Unloaded));
        assert_eq!(ids.object(oid, false).unwrap_err(), ErrorCode::Unloaded);
        assert!(ids.is_unloaded(DomainRef(3)));
    }

    #[test]
    fn test_objects_are_weak_unless_pinned() {
        let mut ids = EntityIds::default();

        let o = obj(0x200, 1);
        let id = ids.object_id(&o, false);
        assert_eq!(ids.object_id(&o, false), id);
        drop(o);
        assert_eq!(ids.object(id, false).unwrap_err(), ErrorCode::InvalidObject);

        let p = obj(0x300, 1);
        let pid = ids.object_id(&p, true);
        drop(p);
        assert!(ids.object(pid, false).is_ok());
        assert_eq!(ids.pinned_count(), 1);

        ids.clear_pins();
        assert_eq!(ids.object(pid, false).unwrap_err(), ErrorCode::InvalidObject);

        ids.sweep();
        assert_eq!(ids.object(pid, false).unwrap_err(), ErrorCode::InvalidObject);
    }

    #[test]
    fn test_resume_forgets_collected_objects() {
        let mut ids = EntityIds::default();

        let kept = obj(0x500, 1);
        let kept_id = ids.object_id(&kept, true);
        let dropped = obj(0x600, 1);
        let dropped_id = ids.object_id(&dropped, true);
        drop(dropped);

        // Pinned while suspended
        assert!(ids.object(dropped_id, false).is_ok());

        ids.vm_resumed();
        assert_eq!(ids.pinned_count(), 0);
        assert!(!ids.objects.contains_key(&dropped_id));
        assert!(!ids.object_ids.contains_key(&0x600));
        assert_eq!(ids.object(dropped_id, false).unwrap_err(), ErrorCode::InvalidObject);

        // Live objects keep their ids across resumes
        assert_eq!(ids.object_id(&kept, false), kept_id);
        assert_eq!(ids.objects.len(), 1);
    }

    #[test]
    fn test_reused_address_gets_new_id() {
        let mut ids = EntityIds::default();
        let first = obj(0x400, 1);
        let id1 = ids.object_id(&first, false);
        drop(first);

        let second = obj(0x400, 1);
        let id2 = ids.object_id(&second, false);
        assert_ne!(id1, id2);
        assert!(ids.object(id2, false).is_ok());
    }
}
