use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Result, bail};

use crate::{
    archive::{Kind, MachineRef},
    tooling::{PveshPort, pvesh::Resource},
};

pub const RESOURCE_CACHE_TTL: Duration = Duration::from_secs(15);

/// Short-lived view of the cluster's guests, owned by one job.
pub struct Inventory {
    pvesh: Arc<dyn PveshPort>,
    node: Option<String>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Resource>)>>,
}

impl Inventory {
    pub fn new(pvesh: Arc<dyn PveshPort>, node: Option<String>) -> Self {
        Self::with_ttl(pvesh, node, RESOURCE_CACHE_TTL)
    }

    pub fn with_ttl(pvesh: Arc<dyn PveshPort>, node: Option<String>, ttl: Duration) -> Self {
        Self {
            pvesh,
            node,
            ttl,
            cache: Mutex::new(None),
        }
    }

    fn resources(&self) -> Result<Vec<Resource>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, cached)) = cache.as_ref()
            && at.elapsed() <= self.ttl
        {
            return Ok(cached.clone());
        }
        let fresh = self.pvesh.cluster_resources()?;
        // An empty answer is not worth remembering.
        *cache = (!fresh.is_empty()).then(|| (Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    fn eligible(&self, r: &Resource) -> Option<MachineRef> {
        let kind = r.kind.parse::<Kind>().ok()?;
        if r.vmid == 0 {
            return None;
        }
        if let Some(node) = &self.node
            && &r.node != node
        {
            return None;
        }
        Some(MachineRef {
            vmid: r.vmid,
            kind,
            node: (!r.node.is_empty()).then(|| r.node.clone()),
        })
    }

    /// Deduplicated by id, ascending.
    fn filter(&self, resources: &[Resource]) -> Vec<MachineRef> {
        let mut by_id = BTreeMap::new();
        for m in resources.iter().filter_map(|r| self.eligible(r)) {
            by_id.entry(m.vmid).or_insert(m);
        }
        by_id.into_values().collect()
    }

    pub fn list_all(&self) -> Result<Vec<MachineRef>> {
        Ok(self.filter(&self.resources()?))
    }

    /// Pool membership is not cached; pools change independently of the
    /// resource list.
    pub fn list_pool(&self, pool: &str) -> Result<Vec<MachineRef>> {
        Ok(self.filter(&self.pvesh.pool_members(pool)?))
    }

    /// Node the inventory is restricted to, if any.
    #[inline]
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn type_of(&self, vmid: u32) -> Result<Kind> {
        match self
            .resources()?
            .iter()
            .filter(|r| r.vmid == vmid)
            .find_map(|r| self.eligible(r))
        {
            Some(m) => Ok(m.kind),
            None => bail!("unable to determine VM type for vmid {vmid}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct ScriptedPvesh {
        resources: Mutex<Vec<Resource>>,
        pool: Vec<Resource>,
        calls: AtomicUsize,
    }

    impl ScriptedPvesh {
        fn new(resources: Vec<Resource>) -> Arc<Self> {
            Arc::new(Self {
                resources: Mutex::new(resources),
                pool: Vec::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl PveshPort for ScriptedPvesh {
        fn cluster_resources(&self) -> Result<Vec<Resource>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.resources.lock().unwrap().clone())
        }
        fn pool_members(&self, _pool: &str) -> Result<Vec<Resource>> {
            Ok(self.pool.clone())
        }
        fn version(&self) -> Result<String> {
            Ok("8".into())
        }
    }

    fn res(vmid: u32, kind: &str, node: &str) -> Resource {
        Resource {
            vmid,
            kind: kind.into(),
            node: node.into(),
        }
    }

    fn ids(ms: &[MachineRef]) -> Vec<u32> {
        ms.iter().map(|m| m.vmid).collect()
    }

    #[test]
    fn list_all_filters_dedups_and_sorts() {
        let pvesh = ScriptedPvesh::new(vec![
            res(300, "lxc", "pve1"),
            res(101, "qemu", "pve1"),
            res(101, "qemu", "pve1"),
            res(0, "storage", "pve1"),
            res(150, "openvz", "pve1"),
            res(200, "qemu", "pve2"),
        ]);
        let inv = Inventory::new(pvesh.clone(), None);
        assert_eq!(ids(&inv.list_all().unwrap()), vec![101, 200, 300]);

        let inv = Inventory::new(pvesh, Some("pve1".into()));
        let all = inv.list_all().unwrap();
        assert_eq!(ids(&all), vec![101, 300]);
        assert_eq!(all[1].kind, Kind::Lxc);
    }

    #[test]
    fn cache_serves_within_ttl() {
        let pvesh = ScriptedPvesh::new(vec![res(101, "qemu", "pve1")]);
        let inv = Inventory::new(pvesh.clone(), None);
        inv.list_all().unwrap();
        inv.type_of(101).unwrap();
        inv.list_all().unwrap();
        assert_eq!(pvesh.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_expires_after_ttl() {
        let pvesh = ScriptedPvesh::new(vec![res(101, "qemu", "pve1")]);
        let inv = Inventory::with_ttl(pvesh.clone(), None, Duration::from_millis(20));
        inv.list_all().unwrap();
        pvesh.resources.lock().unwrap().push(res(102, "lxc", "pve1"));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(ids(&inv.list_all().unwrap()), vec![101, 102]);
        assert_eq!(pvesh.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_result_is_not_cached() {
        let pvesh = ScriptedPvesh::new(Vec::new());
        let inv = Inventory::new(pvesh.clone(), None);
        assert!(inv.list_all().unwrap().is_empty());
        pvesh.resources.lock().unwrap().push(res(7, "lxc", "pve1"));
        assert_eq!(ids(&inv.list_all().unwrap()), vec![7]);
        assert_eq!(pvesh.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cached_copy_is_isolated_from_callers() {
        let pvesh = ScriptedPvesh::new(vec![res(101, "qemu", "pve1")]);
        let inv = Inventory::new(pvesh, None);
        let mut first = inv.resources().unwrap();
        first.clear();
        assert_eq!(inv.resources().unwrap().len(), 1);
    }

    #[test]
    fn type_of_respects_node_filter() {
        let pvesh = ScriptedPvesh::new(vec![res(101, "qemu", "pve1"), res(200, "lxc", "pve2")]);
        let inv = Inventory::new(pvesh, Some("pve1".into()));
        assert_eq!(inv.type_of(101).unwrap(), Kind::Qemu);
        let err = inv.type_of(200).unwrap_err().to_string();
        assert_eq!(err, "unable to determine VM type for vmid 200");
        assert!(inv.type_of(999).is_err());
    }

    #[test]
    fn pool_members_use_same_filter() {
        let pvesh = Arc::new(ScriptedPvesh {
            resources: Mutex::new(Vec::new()),
            pool: vec![
                res(5, "lxc", "pve1"),
                res(0, "storage", "pve1"),
                res(3, "qemu", "pve1"),
            ],
            calls: AtomicUsize::new(0),
        });
        let inv = Inventory::new(pvesh, None);
        assert_eq!(ids(&inv.list_pool("prod").unwrap()), vec![3, 5]);
    }
}
