//! Nodes, services and health checks.

use std::collections::{BTreeMap, BTreeSet};

use beacon_table::{ID_INDEX, Readable, WriteTxn};
use tracing::debug;

use super::{Changes, StateStore};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    // ── Writes ─────────────────────────────────────────────────────

    /// Register a node and, optionally, a service and checks on it, in
    /// one transaction. Later parts see the earlier ones.
    pub fn ensure_registration(&self, index: u64, req: &RegisterRequest) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();

        let node = Node {
            node: req.node.clone(),
            address: req.address.clone(),
            ..Default::default()
        };
        self.ensure_node_txn(&txn, index, &mut changes, &node)?;
        if let Some(service) = &req.service {
            self.ensure_service_txn(&txn, index, &mut changes, &req.node, service)?;
        }
        for check in req.check.iter().chain(&req.checks) {
            let mut check = check.clone();
            if check.node.is_empty() {
                check.node = req.node.clone();
            }
            self.ensure_check_txn(&txn, index, &mut changes, &check)?;
        }

        self.finish(txn, changes)?;
        debug!(index, node = %req.node, "registration applied");
        Ok(())
    }

    pub fn ensure_node(&self, index: u64, node: &Node) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.ensure_node_txn(&txn, index, &mut changes, node)?;
        self.finish(txn, changes)
    }

    pub fn ensure_service(&self, index: u64, node: &str, service: &NodeService) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.ensure_service_txn(&txn, index, &mut changes, node, service)?;
        self.finish(txn, changes)
    }

    pub fn ensure_check(&self, index: u64, check: &HealthCheck) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.ensure_check_txn(&txn, index, &mut changes, check)?;
        self.finish(txn, changes)
    }

    /// Delete a node with its services, checks and sessions.
    pub fn delete_node(&self, index: u64, node: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.delete_node_txn(&txn, index, &mut changes, node)?;
        self.finish(txn, changes)
    }

    /// Delete a service with the checks scoped to it.
    pub fn delete_service(&self, index: u64, node: &str, service_id: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.delete_service_txn(&txn, index, &mut changes, node, service_id)?;
        self.finish(txn, changes)
    }

    /// Delete a check, invalidating every session bound to it.
    pub fn delete_check(&self, index: u64, node: &str, check_id: &str) -> StateResult<()> {
        let txn = self.write()?;
        let mut changes = Changes::new();
        self.delete_check_txn(&txn, index, &mut changes, node, check_id)?;
        self.finish(txn, changes)
    }

    pub(crate) fn ensure_node_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        node: &Node,
    ) -> StateResult<()> {
        let existing = self.tables.nodes.first(txn, ID_INDEX, &[&node.node])?;
        let row = Node {
            create_index: existing.map_or(index, |n| n.create_index),
            modify_index: index,
            ..node.clone()
        };
        self.tables.nodes.insert(txn, &row)?;
        self.tables.bump(txn, NODES, index)?;
        changes.table(NODES);
        Ok(())
    }

    pub(crate) fn ensure_service_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        node: &str,
        service: &NodeService,
    ) -> StateResult<()> {
        if self.tables.nodes.first(txn, ID_INDEX, &[node])?.is_none() {
            return Err(StateError::MissingNode(node.to_string()));
        }
        let existing = self.tables.services.first(txn, ID_INDEX, &[node, &service.id])?;
        let row = ServiceNode {
            node: node.to_string(),
            address: String::new(),
            service_id: service.id.clone(),
            service_name: service.service.clone(),
            service_tags: service.tags.clone(),
            service_address: service.address.clone(),
            service_port: service.port,
            create_index: existing.map_or(index, |s| s.create_index),
            modify_index: index,
        };
        self.tables.services.insert(txn, &row)?;
        self.tables.bump(txn, SERVICES, index)?;
        changes.table(SERVICES);
        Ok(())
    }

    pub(crate) fn ensure_check_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        check: &HealthCheck,
    ) -> StateResult<()> {
        if self.tables.nodes.first(txn, ID_INDEX, &[&check.node])?.is_none() {
            return Err(StateError::MissingNode(check.node.clone()));
        }
        let mut row = check.clone();
        if !row.service_id.is_empty() {
            let service = self
                .tables
                .services
                .first(txn, ID_INDEX, &[&row.node, &row.service_id])?
                .ok_or_else(|| StateError::MissingService(row.service_id.clone()))?;
            row.service_name = service.service_name;
        }
        let existing = self.tables.checks.first(txn, ID_INDEX, &[&row.node, &row.check_id])?;
        row.create_index = existing.map_or(index, |c| c.create_index);
        row.modify_index = index;

        if row.status == HealthStatus::Critical {
            for session in self.sessions_bound_to(txn, &row.node, &row.check_id)? {
                self.delete_session_txn(txn, index, changes, &session)?;
            }
        }

        self.tables.checks.insert(txn, &row)?;
        self.tables.bump(txn, CHECKS, index)?;
        changes.table(CHECKS);
        Ok(())
    }

    pub(crate) fn delete_node_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        node: &str,
    ) -> StateResult<()> {
        if self.tables.nodes.first(txn, ID_INDEX, &[node])?.is_none() {
            return Ok(());
        }

        let services: Vec<ServiceNode> = self
            .tables
            .services
            .get(txn, BY_NODE, &[node])?
            .collect::<Result<_, _>>()?;
        for service in &services {
            self.delete_service_txn(txn, index, changes, node, &service.service_id)?;
        }
        let checks: Vec<HealthCheck> = self
            .tables
            .checks
            .get(txn, BY_NODE, &[node])?
            .collect::<Result<_, _>>()?;
        for check in &checks {
            self.delete_check_txn(txn, index, changes, node, &check.check_id)?;
        }

        self.tables.nodes.delete(txn, ID_INDEX, &[node])?;
        self.tables.bump(txn, NODES, index)?;
        changes.table(NODES);

        let sessions: Vec<Session> = self
            .tables
            .sessions
            .get(txn, BY_NODE, &[node])?
            .collect::<Result<_, _>>()?;
        for session in &sessions {
            self.delete_session_txn(txn, index, changes, &session.id)?;
        }
        debug!(index, %node, services = services.len(), checks = checks.len(), "node deleted");
        Ok(())
    }

    pub(crate) fn delete_service_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        node: &str,
        service_id: &str,
    ) -> StateResult<()> {
        if self
            .tables
            .services
            .first(txn, ID_INDEX, &[node, service_id])?
            .is_none()
        {
            return Ok(());
        }

        let checks: Vec<HealthCheck> = self
            .tables
            .checks
            .get(txn, BY_NODE_SERVICE, &[node, service_id])?
            .collect::<Result<_, _>>()?;
        for check in &checks {
            self.delete_check_txn(txn, index, changes, node, &check.check_id)?;
        }

        self.tables.services.delete(txn, ID_INDEX, &[node, service_id])?;
        self.tables.bump(txn, SERVICES, index)?;
        changes.table(SERVICES);
        Ok(())
    }

    pub(crate) fn delete_check_txn(
        &self,
        txn: &WriteTxn<'_>,
        index: u64,
        changes: &mut Changes,
        node: &str,
        check_id: &str,
    ) -> StateResult<()> {
        if self.tables.checks.delete(txn, ID_INDEX, &[node, check_id])? == 0 {
            return Ok(());
        }
        self.tables.bump(txn, CHECKS, index)?;
        changes.table(CHECKS);

        for session in self.sessions_bound_to(txn, node, check_id)? {
            self.delete_session_txn(txn, index, changes, &session)?;
        }
        Ok(())
    }

    fn sessions_bound_to<R: Readable>(&self, reader: &R, node: &str, check_id: &str) -> StateResult<Vec<String>> {
        let mut sessions = Vec::new();
        for mapping in self.tables.session_checks.get(reader, BY_NODE_CHECK, &[node, check_id])? {
            sessions.push(mapping?.session);
        }
        Ok(sessions)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_node(&self, node: &str) -> StateResult<(u64, Option<Node>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES])?;
        Ok((index, self.tables.nodes.first(&read, ID_INDEX, &[node])?))
    }

    pub fn nodes(&self) -> StateResult<(u64, Vec<Node>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES])?;
        let nodes = self.tables.nodes.all(&read)?.collect::<Result<_, _>>()?;
        Ok((index, nodes))
    }

    /// Every service name with the union of its tags.
    pub fn services(&self) -> StateResult<(u64, Services)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[SERVICES])?;
        let mut unique: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for service in self.tables.services.all(&read)? {
            let service = service?;
            unique
                .entry(service.service_name)
                .or_default()
                .extend(service.service_tags);
        }
        let services = unique
            .into_iter()
            .map(|(name, tags)| (name, tags.into_iter().collect()))
            .collect();
        Ok((index, services))
    }

    /// Instances of a service, with their node addresses.
    pub fn service_nodes(&self, service: &str) -> StateResult<(u64, Vec<ServiceNode>)> {
        self.service_nodes_filtered(service, None)
    }

    /// Instances of a service carrying `tag` (case-insensitive).
    pub fn service_tag_nodes(&self, service: &str, tag: &str) -> StateResult<(u64, Vec<ServiceNode>)> {
        self.service_nodes_filtered(service, Some(tag))
    }

    fn service_nodes_filtered(&self, service: &str, tag: Option<&str>) -> StateResult<(u64, Vec<ServiceNode>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES, SERVICES])?;
        let mut results = Vec::new();
        for sn in self.tables.services.get(&read, BY_SERVICE, &[service])? {
            let mut sn = sn?;
            if tag.is_some_and(|t| !sn.has_tag(t)) {
                continue;
            }
            let node = self
                .tables
                .nodes
                .first(&read, ID_INDEX, &[&sn.node])?
                .ok_or_else(|| StateError::MissingNode(sn.node.clone()))?;
            sn.address = node.address;
            results.push(sn);
        }
        Ok((index, results))
    }

    pub fn node_services(&self, node: &str) -> StateResult<(u64, Option<NodeServices>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES, SERVICES])?;
        let Some(node) = self.tables.nodes.first(&read, ID_INDEX, &[node])? else {
            return Ok((index, None));
        };
        let mut services = BTreeMap::new();
        for sn in self.tables.services.get(&read, BY_NODE, &[&node.node])? {
            let svc = sn?.to_node_service();
            services.insert(svc.id.clone(), svc);
        }
        Ok((index, Some(NodeServices { node, services })))
    }

    /// Each service of a node with the checks scoped to it.
    pub fn node_services_with_checks(&self, node: &str) -> StateResult<(u64, Vec<ServiceWithChecks>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES, SERVICES, CHECKS])?;
        let mut results = Vec::new();
        for sn in self.tables.services.get(&read, BY_NODE, &[node])? {
            let sn = sn?;
            let checks = self
                .tables
                .checks
                .get(&read, BY_NODE_SERVICE, &[node, &sn.service_id])?
                .collect::<Result<_, _>>()?;
            results.push(ServiceWithChecks {
                service: sn.to_node_service(),
                checks,
            });
        }
        Ok((index, results))
    }

    pub fn node_checks(&self, node: &str) -> StateResult<(u64, Vec<HealthCheck>)> {
        self.checks_by(BY_NODE, &[node])
    }

    /// Checks scoped to any instance of the named service.
    pub fn service_checks(&self, service: &str) -> StateResult<(u64, Vec<HealthCheck>)> {
        self.checks_by(BY_SERVICE, &[service])
    }

    /// Checks in `state`, or every check when `state` is `None`.
    pub fn checks_in_state(&self, state: Option<HealthStatus>) -> StateResult<(u64, Vec<HealthCheck>)> {
        match state {
            Some(status) => self.checks_by(BY_STATUS, &[status.as_str()]),
            None => self.checks_by(BY_STATUS, &[]),
        }
    }

    fn checks_by(&self, index_name: &str, parts: &[&str]) -> StateResult<(u64, Vec<HealthCheck>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[CHECKS])?;
        let checks = self
            .tables
            .checks
            .get(&read, index_name, parts)?
            .collect::<Result<_, _>>()?;
        Ok((index, checks))
    }

    /// Instances of a service with their nodes and checks.
    pub fn check_service_nodes(&self, service: &str) -> StateResult<(u64, Vec<CheckServiceNode>)> {
        self.check_service_nodes_filtered(service, None)
    }

    pub fn check_service_tag_nodes(&self, service: &str, tag: &str) -> StateResult<(u64, Vec<CheckServiceNode>)> {
        self.check_service_nodes_filtered(service, Some(tag))
    }

    fn check_service_nodes_filtered(
        &self,
        service: &str,
        tag: Option<&str>,
    ) -> StateResult<(u64, Vec<CheckServiceNode>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES, SERVICES, CHECKS])?;
        let mut results = Vec::new();
        for sn in self.tables.services.get(&read, BY_SERVICE, &[service])? {
            let sn = sn?;
            if tag.is_some_and(|t| !sn.has_tag(t)) {
                continue;
            }
            let node = self
                .tables
                .nodes
                .first(&read, ID_INDEX, &[&sn.node])?
                .ok_or_else(|| StateError::MissingNode(sn.node.clone()))?;
            let checks = self
                .tables
                .checks
                .get(&read, BY_NODE_SERVICE, &[&sn.node, &sn.service_id])?
                .collect::<Result<_, _>>()?;
            results.push(CheckServiceNode {
                node,
                service: sn.to_node_service(),
                checks,
            });
        }
        Ok((index, results))
    }

    /// Everything registered against one node.
    pub fn node_info(&self, node: &str) -> StateResult<(u64, Vec<NodeInfo>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES, SERVICES, CHECKS])?;
        let nodes = self.tables.nodes.get(&read, ID_INDEX, &[node])?;
        Ok((index, self.dump_nodes(&read, nodes)?))
    }

    /// Everything registered against every node.
    pub fn node_dump(&self) -> StateResult<(u64, Vec<NodeInfo>)> {
        let read = self.read()?;
        let index = self.tables.max_index(&read, &[NODES, SERVICES, CHECKS])?;
        let nodes = self.tables.nodes.all(&read)?;
        Ok((index, self.dump_nodes(&read, nodes)?))
    }

    fn dump_nodes<R: Readable>(
        &self,
        reader: &R,
        nodes: impl Iterator<Item = beacon_table::TableResult<Node>>,
    ) -> StateResult<Vec<NodeInfo>> {
        let mut dump = Vec::new();
        for node in nodes {
            let node = node?;
            let services = self
                .tables
                .services
                .get(reader, BY_NODE, &[&node.node])?
                .map(|sn| sn.map(|sn| sn.to_node_service()))
                .collect::<Result<_, _>>()?;
            let checks = self
                .tables
                .checks
                .get(reader, BY_NODE, &[&node.node])?
                .collect::<Result<_, _>>()?;
            dump.push(NodeInfo {
                node: node.node,
                address: node.address,
                services,
                checks,
            });
        }
        Ok(dump)
    }
}
