use crate::firewall_backend::{BackendFuture, FirewallBackend, FirewallRule, Table};

pub struct NoopFirewallBackend {
    _priv: (),
}

impl NoopFirewallBackend {
    pub fn new() -> Self {
        log::info!("Firewall backend is disabled");
        Self { _priv: () }
    }
}

impl FirewallBackend for NoopFirewallBackend {
    fn create_chain<'a>(&'a self, _table: Table, _chain: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn delete_chain<'a>(&'a self, _table: Table, _chain: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn list_rules<'a>(
        &'a self,
        _table: Table,
        _chain: &'a str,
    ) -> BackendFuture<'a, Vec<FirewallRule>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn append_unique<'a>(&'a self, _rule: &'a FirewallRule) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn insert<'a>(&'a self, rule: &'a FirewallRule, _position: u32) -> BackendFuture<'a, ()> {
        log::debug!("Not inserting rule {rule}");
        Box::pin(async { Ok(()) })
    }

    fn delete<'a>(&'a self, _rule: &'a FirewallRule) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
