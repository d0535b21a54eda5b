pub mod iptables;
pub mod noop;

use ipnet::Ipv4Net;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use thiserror::Error;

pub type BackendFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, FirewallError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },

    #[error("'{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Invalid chain name '{0}': expected at most 28 characters out of [0-9a-zA-Z_]")]
    InvalidChainName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Mangle,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Mangle => "mangle",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A rule in a packet-filter chain.
///
/// `args` holds the match predicate and the action in iptables syntax, exactly as they are passed to
/// (or listed by) the firewall. The ownership tag is carried as a comment match inside `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: String,
    pub args: Vec<String>,
}

impl FirewallRule {
    /// Builds a rule of the form `<matches> -m comment --comment <tag> -j <target>`
    pub fn tagged(table: Table, chain: &str, matches: &[&str], tag: &str, target: &[&str]) -> Self {
        let args = matches
            .iter()
            .copied()
            .chain(["-m", "comment", "--comment", tag, "-j"])
            .chain(target.iter().copied())
            .map(String::from)
            .collect();

        Self {
            table,
            chain: chain.to_owned(),
            args,
        }
    }

    /// The ownership comment, if any
    pub fn tag(&self) -> Option<&str> {
        self.option_value("--comment")
    }

    /// The `-s` match, if it is an IPv4 network
    pub fn source(&self) -> Option<Ipv4Net> {
        let source = self.option_value("-s")?;
        source
            .parse::<Ipv4Net>()
            .ok()
            .or_else(|| source.parse::<Ipv4Addr>().ok().map(Ipv4Net::from))
    }

    fn option_value(&self, option: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|pair| pair[0] == option)
            .map(|pair| pair[1].as_str())
    }
}

impl std::fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.args.join(" "))
    }
}

/// Structured access to the kernel packet filter.
///
/// Implementations only touch the chains and rules they are asked to; deciding which rules are
/// owned by this process is up to the caller.
pub trait FirewallBackend: Send + Sync {
    /// Creates `chain` in `table`, or flushes it if it already exists
    fn create_chain<'a>(&'a self, table: Table, chain: &'a str) -> BackendFuture<'a, ()>;

    /// Flushes and deletes `chain` from `table`
    fn delete_chain<'a>(&'a self, table: Table, chain: &'a str) -> BackendFuture<'a, ()>;

    /// Lists the rules of `chain` in order
    fn list_rules<'a>(&'a self, table: Table, chain: &'a str)
        -> BackendFuture<'a, Vec<FirewallRule>>;

    /// Appends `rule` to its chain unless an identical rule is already present
    fn append_unique<'a>(&'a self, rule: &'a FirewallRule) -> BackendFuture<'a, ()>;

    /// Inserts `rule` at the 1-based `position` of its chain
    fn insert<'a>(&'a self, rule: &'a FirewallRule, position: u32) -> BackendFuture<'a, ()>;

    fn delete<'a>(&'a self, rule: &'a FirewallRule) -> BackendFuture<'a, ()>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory packet filter recording every mutation, with failure injection
    #[derive(Clone, Default)]
    pub struct RecordingFirewallBackend {
        state: Arc<Mutex<RecordingState>>,
    }

    #[derive(Default)]
    struct RecordingState {
        chains: HashMap<(Table, String), Vec<FirewallRule>>,
        mutations: Vec<String>,
        listings: usize,
        failures: Vec<(String, usize)>,
    }

    impl RecordingFirewallBackend {
        pub fn new() -> Self {
            let backend = Self::default();
            {
                let mut state = backend.state.lock().unwrap();
                for table in [Table::Nat, Table::Mangle] {
                    state.chains.insert((table, "PREROUTING".to_owned()), Vec::new());
                }
            }
            backend
        }

        /// Lets the next `times` operations whose description contains `pattern` fail
        pub fn fail_on(&self, pattern: &str, times: usize) {
            let mut state = self.state.lock().unwrap();
            state.failures.push((pattern.to_owned(), times));
        }

        pub fn rules(&self, table: Table, chain: &str) -> Vec<FirewallRule> {
            let state = self.state.lock().unwrap();
            state
                .chains
                .get(&(table, chain.to_owned()))
                .cloned()
                .unwrap_or_default()
        }

        pub fn has_chain(&self, table: Table, chain: &str) -> bool {
            let state = self.state.lock().unwrap();
            state.chains.contains_key(&(table, chain.to_owned()))
        }

        /// Every rule in every chain
        pub fn all_rules(&self) -> Vec<FirewallRule> {
            let state = self.state.lock().unwrap();
            state.chains.values().flatten().cloned().collect()
        }

        /// Adds a rule behind the back of the controller
        pub fn add_foreign_rule(&self, rule: FirewallRule) {
            let mut state = self.state.lock().unwrap();
            state
                .chains
                .entry((rule.table, rule.chain.clone()))
                .or_default()
                .push(rule);
        }

        pub fn mutations(&self) -> Vec<String> {
            self.state.lock().unwrap().mutations.clone()
        }

        /// Number of successful `list_rules` calls
        pub fn listings(&self) -> usize {
            self.state.lock().unwrap().listings
        }

        pub fn clear_mutations(&self) {
            self.state.lock().unwrap().mutations.clear();
        }

        fn apply<T>(
            &self,
            operation: String,
            mutating: bool,
            f: impl FnOnce(&mut HashMap<(Table, String), Vec<FirewallRule>>) -> Result<T, String>,
        ) -> Result<T, FirewallError> {
            let mut state = self.state.lock().unwrap();

            if let Some(failure) = state
                .failures
                .iter_mut()
                .find(|(pattern, times)| *times > 0 && operation.contains(pattern.as_str()))
            {
                failure.1 -= 1;
                return Err(FirewallError::CommandFailed {
                    command: operation,
                    reason: "injected failure".to_owned(),
                });
            }

            let result = f(&mut state.chains).map_err(|reason| FirewallError::CommandFailed {
                command: operation.clone(),
                reason,
            })?;

            if mutating {
                state.mutations.push(operation);
            } else {
                state.listings += 1;
            }
            Ok(result)
        }
    }

    impl FirewallBackend for RecordingFirewallBackend {
        fn create_chain<'a>(&'a self, table: Table, chain: &'a str) -> BackendFuture<'a, ()> {
            let result = self.apply(format!("create {table} {chain}"), true, |chains| {
                chains.insert((table, chain.to_owned()), Vec::new());
                Ok(())
            });
            Box::pin(async move { result })
        }

        fn delete_chain<'a>(&'a self, table: Table, chain: &'a str) -> BackendFuture<'a, ()> {
            let result = self.apply(format!("delete-chain {table} {chain}"), true, |chains| {
                let referenced = chains
                    .values()
                    .flatten()
                    .any(|rule| rule.args.iter().any(|arg| arg == chain));
                if referenced {
                    return Err("chain is still referenced".to_owned());
                }
                chains
                    .remove(&(table, chain.to_owned()))
                    .map(|_| ())
                    .ok_or_else(|| "no such chain".to_owned())
            });
            Box::pin(async move { result })
        }

        fn list_rules<'a>(
            &'a self,
            table: Table,
            chain: &'a str,
        ) -> BackendFuture<'a, Vec<FirewallRule>> {
            let result = self.apply(format!("list {table} {chain}"), false, |chains| {
                chains
                    .get(&(table, chain.to_owned()))
                    .cloned()
                    .ok_or_else(|| "no such chain".to_owned())
            });
            Box::pin(async move { result })
        }

        fn append_unique<'a>(&'a self, rule: &'a FirewallRule) -> BackendFuture<'a, ()> {
            let result = self.apply(format!("append {rule}"), true, |chains| {
                let rules = chains
                    .get_mut(&(rule.table, rule.chain.clone()))
                    .ok_or_else(|| "no such chain".to_owned())?;
                if !rules.contains(rule) {
                    rules.push(rule.clone());
                }
                Ok(())
            });
            Box::pin(async move { result })
        }

        fn insert<'a>(&'a self, rule: &'a FirewallRule, position: u32) -> BackendFuture<'a, ()> {
            let result = self.apply(format!("insert {rule}"), true, |chains| {
                let rules = chains
                    .get_mut(&(rule.table, rule.chain.clone()))
                    .ok_or_else(|| "no such chain".to_owned())?;
                let index = (position as usize).saturating_sub(1).min(rules.len());
                rules.insert(index, rule.clone());
                Ok(())
            });
            Box::pin(async move { result })
        }

        fn delete<'a>(&'a self, rule: &'a FirewallRule) -> BackendFuture<'a, ()> {
            let result = self.apply(format!("delete {rule}"), true, |chains| {
                let rules = chains
                    .get_mut(&(rule.table, rule.chain.clone()))
                    .ok_or_else(|| "no such chain".to_owned())?;
                let index = rules
                    .iter()
                    .position(|candidate| candidate == rule)
                    .ok_or_else(|| "no such rule".to_owned())?;
                rules.remove(index);
                Ok(())
            });
            Box::pin(async move { result })
        }
    }

    #[test]
    fn tagged_rule_layout() {
        let rule = FirewallRule::tagged(
            Table::Nat,
            "knockfw_22",
            &["-p", "tcp", "-s", "10.0.0.1/32"],
            "knockfw_22:10.0.0.1:accept",
            &["RETURN"],
        );

        assert_eq!(
            rule.args,
            [
                "-p",
                "tcp",
                "-s",
                "10.0.0.1/32",
                "-m",
                "comment",
                "--comment",
                "knockfw_22:10.0.0.1:accept",
                "-j",
                "RETURN"
            ]
        );
        assert_eq!(rule.tag(), Some("knockfw_22:10.0.0.1:accept"));
        assert_eq!(rule.source(), Some("10.0.0.1/32".parse().unwrap()));
    }

    #[test]
    fn source_without_prefix_length() {
        let rule = FirewallRule {
            table: Table::Nat,
            chain: "knockfw_22".to_owned(),
            args: vec!["-s".to_owned(), "10.0.0.1".to_owned()],
        };
        assert_eq!(rule.source(), Some("10.0.0.1/32".parse().unwrap()));
        assert_eq!(rule.tag(), None);
    }
}
