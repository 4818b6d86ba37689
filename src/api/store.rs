use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::portal::Portal;
use super::stmt::PreparedStatement;

/// Session-scoped named slots for prepared statements and portals. The empty
/// name is the protocol's rebindable "unnamed" slot in both maps.
#[derive(Debug, Default)]
pub struct SessionStore {
    statements: RwLock<BTreeMap<String, Arc<PreparedStatement>>>,
    portals: RwLock<BTreeMap<String, Arc<Portal>>>,
}

impl SessionStore {
    pub fn new() -> SessionStore {
        SessionStore::default()
    }

    pub fn put_statement(&self, statement: PreparedStatement) {
        let mut guard = self.statements.write().unwrap();
        guard.insert(statement.name.clone(), Arc::new(statement));
    }

    pub fn rm_statement(&self, name: &str) {
        let mut guard = self.statements.write().unwrap();
        guard.remove(name);
    }

    pub fn get_statement(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        let guard = self.statements.read().unwrap();
        guard.get(name).cloned()
    }

    pub fn has_statement(&self, name: &str) -> bool {
        let guard = self.statements.read().unwrap();
        guard.contains_key(name)
    }

    pub fn put_portal(&self, portal: Portal) {
        let mut guard = self.portals.write().unwrap();
        guard.insert(portal.name.clone(), Arc::new(portal));
    }

    pub fn rm_portal(&self, name: &str) {
        let mut guard = self.portals.write().unwrap();
        guard.remove(name);
    }

    pub fn get_portal(&self, name: &str) -> Option<Arc<Portal>> {
        let guard = self.portals.read().unwrap();
        guard.get(name).cloned()
    }

    pub fn has_portal(&self, name: &str) -> bool {
        let guard = self.portals.read().unwrap();
        guard.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::router::QueryKind;

    #[test]
    fn test_parse_then_close_restores_lookup_state() {
        let store = SessionStore::new();
        assert!(store.get_statement("q1").is_none());

        store.put_statement(PreparedStatement::new(
            "q1".to_owned(),
            "SELECT 1".to_owned(),
            vec![],
            QueryKind::Read,
        ));
        assert!(store.has_statement("q1"));

        store.rm_statement("q1");
        assert!(store.get_statement("q1").is_none());
    }

    #[test]
    fn test_unnamed_slot_is_rebindable() {
        let store = SessionStore::new();
        store.put_statement(PreparedStatement::new(
            String::new(),
            "SELECT 1".to_owned(),
            vec![],
            QueryKind::Read,
        ));
        store.put_statement(PreparedStatement::new(
            String::new(),
            "INSERT INTO t VALUES (1)".to_owned(),
            vec![],
            QueryKind::Write,
        ));

        let stmt = store.get_statement("").unwrap();
        assert_eq!(stmt.kind, QueryKind::Write);
    }
}
