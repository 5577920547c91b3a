use crate::tracer::address::TargetAddress;
use crate::tracer::error::Error;
use crate::tracer::tracepoint::{Tracepoint, TracepointDef, TracepointKind};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Stable identifier of a registry entry. Distinct from the
/// debugger-assigned tracepoint number, which several entries may share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tracepoint kinds resolvable on the current target. Trap tracepoints are
/// always available; fast requires a jump pad region, static requires a
/// marker-library hook collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindSupport {
    pub fast: bool,
    pub r#static: bool,
}

impl KindSupport {
    fn supports(&self, kind: TracepointKind) -> bool {
        match kind {
            TracepointKind::Trap => true,
            TracepointKind::Fast => self.fast,
            TracepointKind::Static => self.r#static,
        }
    }
}

/// Container for all tracepoint definitions, indexed by number and by
/// address. Both indices are multimaps: multi-location tracepoints share a
/// number, stacked tracepoints share an address.
pub(super) struct TracepointRegistry {
    support: KindSupport,
    /// Entries in creation order.
    entries: IndexMap<EntryId, Arc<Tracepoint>>,
    by_number: HashMap<u32, Vec<EntryId>>,
    by_address: HashMap<TargetAddress, Vec<EntryId>>,
    next_id: u64,
}

impl TracepointRegistry {
    pub(super) fn new(support: KindSupport) -> Self {
        Self {
            support,
            entries: IndexMap::new(),
            by_number: HashMap::new(),
            by_address: HashMap::new(),
            next_id: 1,
        }
    }

    /// Create a fresh entry from a decoded definition.
    ///
    /// The new entry starts uninstalled with a zero hit count. Entries
    /// stacked at one address must share a kind: a single physical patch
    /// serves all of them, and mixing mechanisms at one address would
    /// require two patches at the same bytes.
    pub(super) fn define(&mut self, def: TracepointDef) -> Result<EntryId, Error> {
        if def.address.is_null() {
            return Err(Error::InvalidSpec("null address"));
        }
        if !self.support.supports(def.kind) {
            return Err(Error::UnsupportedKind(def.kind));
        }
        if self
            .find_by_address(def.address)
            .iter()
            .any(|tp| tp.kind() != def.kind)
        {
            return Err(Error::InvalidSpec(
                "tracepoints stacked at one address must share a kind",
            ));
        }

        let id = EntryId(self.next_id);
        self.next_id += 1;

        let number = def.number;
        let address = def.address;
        self.entries.insert(id, Arc::new(Tracepoint::new(def)));
        self.by_number.entry(number).or_default().push(id);
        self.by_address.entry(address).or_default().push(id);
        Ok(id)
    }

    pub(super) fn get(&self, id: EntryId) -> Option<&Arc<Tracepoint>> {
        self.entries.get(&id)
    }

    /// All entries sharing a number, in creation order.
    pub(super) fn find_by_number(&self, number: u32) -> Vec<Arc<Tracepoint>> {
        self.resolve(self.by_number.get(&number))
    }

    /// All entries stacked at an address, in creation order.
    pub(super) fn find_by_address(&self, address: TargetAddress) -> Vec<Arc<Tracepoint>> {
        self.resolve(self.by_address.get(&address))
    }

    fn resolve(&self, ids: Option<&Vec<EntryId>>) -> Vec<Arc<Tracepoint>> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.entries.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Delete an entry. The entry must be uninstalled first: removal of a
    /// live patch belongs to the owning mechanism.
    pub(super) fn remove(&mut self, id: EntryId) -> Result<Arc<Tracepoint>, Error> {
        let tp = self.entries.get(&id).ok_or(Error::EntryNotFound(id))?;
        if tp.is_installed() {
            return Err(Error::StillInstalled(tp.number()));
        }

        let tp = self
            .entries
            .shift_remove(&id)
            .expect("entry existence just checked");
        Self::unindex(&mut self.by_number, tp.number(), id);
        Self::unindex(&mut self.by_address, tp.address(), id);
        Ok(tp)
    }

    fn unindex<K: std::hash::Hash + Eq>(index: &mut HashMap<K, Vec<EntryId>>, key: K, id: EntryId) {
        if let Some(ids) = index.get_mut(&key) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                index.remove(&key);
            }
        }
    }

    /// Delete every entry. All entries must be uninstalled first.
    pub(super) fn clear_all(&mut self) -> Result<(), Error> {
        if let Some(tp) = self.entries.values().find(|tp| tp.is_installed()) {
            return Err(Error::StillInstalled(tp.number()));
        }
        self.entries.clear();
        self.by_number.clear();
        self.by_address.clear();
        Ok(())
    }

    /// All entries in creation order.
    pub(super) fn list(&self) -> impl Iterator<Item = &Arc<Tracepoint>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracer::tracepoint::InstalledMechanism;
    use crate::tracer::InstallHandle;

    fn def(number: u32, address: u64, kind: TracepointKind) -> TracepointDef {
        TracepointDef {
            number,
            address: TargetAddress::from(address),
            kind,
            enabled: true,
            step_count: 0,
            pass_count: 0,
            condition: None,
            actions: vec![],
            step_actions: vec![],
            source_strings: vec![],
        }
    }

    fn registry() -> TracepointRegistry {
        TracepointRegistry::new(KindSupport {
            fast: true,
            r#static: true,
        })
    }

    #[test]
    fn test_indices_track_define_and_remove() {
        let mut reg = registry();
        let id1 = reg.define(def(1, 0x1000, TracepointKind::Trap)).unwrap();
        let id2 = reg.define(def(1, 0x2000, TracepointKind::Fast)).unwrap();
        let id3 = reg.define(def(2, 0x2000, TracepointKind::Fast)).unwrap();

        assert_eq!(reg.find_by_number(1).len(), 2);
        assert_eq!(reg.find_by_address(TargetAddress::from(0x2000u64)).len(), 2);

        reg.remove(id2).unwrap();
        assert_eq!(reg.find_by_number(1).len(), 1);
        let stacked = reg.find_by_address(TargetAddress::from(0x2000u64));
        assert_eq!(stacked.len(), 1);
        assert_eq!(stacked[0].number(), 2);

        reg.remove(id1).unwrap();
        reg.remove(id3).unwrap();
        assert!(reg.find_by_number(1).is_empty());
        assert!(reg.find_by_number(2).is_empty());
        assert!(reg
            .find_by_address(TargetAddress::from(0x2000u64))
            .is_empty());
        assert_eq!(reg.list().count(), 0);
    }

    #[test]
    fn test_creation_order_is_preserved() {
        let mut reg = registry();
        for n in 1..=4 {
            reg.define(def(n, 0x3000, TracepointKind::Trap)).unwrap();
        }
        let numbers: Vec<u32> = reg
            .find_by_address(TargetAddress::from(0x3000u64))
            .iter()
            .map(|tp| tp.number())
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_define_rejections() {
        let mut reg = TracepointRegistry::new(KindSupport::default());
        assert!(matches!(
            reg.define(def(1, 0, TracepointKind::Trap)),
            Err(Error::InvalidSpec(_))
        ));
        assert!(matches!(
            reg.define(def(1, 0x1000, TracepointKind::Fast)),
            Err(Error::UnsupportedKind(TracepointKind::Fast))
        ));
        assert!(matches!(
            reg.define(def(1, 0x1000, TracepointKind::Static)),
            Err(Error::UnsupportedKind(TracepointKind::Static))
        ));

        let mut reg = registry();
        reg.define(def(1, 0x1000, TracepointKind::Trap)).unwrap();
        assert!(matches!(
            reg.define(def(2, 0x1000, TracepointKind::Fast)),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_remove_installed_entry_is_rejected() {
        let mut reg = registry();
        let id = reg.define(def(7, 0x1000, TracepointKind::Trap)).unwrap();
        reg.get(id)
            .unwrap()
            .set_installed(InstalledMechanism::Trap(InstallHandle(1)));

        assert!(matches!(reg.remove(id), Err(Error::StillInstalled(7))));
        assert!(matches!(reg.clear_all(), Err(Error::StillInstalled(7))));

        reg.get(id).unwrap().clear_installed();
        assert!(reg.remove(id).is_ok());
    }
}
