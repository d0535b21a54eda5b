use crate::firewall_backend::{FirewallBackend, FirewallError, FirewallRule, Table};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

const CHAIN_PREFIX: &str = "knockfw_";
const MAX_CHAIN_NAME_LENGTH: usize = 28;
const PREROUTING: &str = "PREROUTING";

/// Packet mark distinguishing the first packet of a knock from traffic that was already classified
pub const KNOCK_MARK: &str = "777";

/// Name of the chain owned by this process. Doubles as the prefix of every ownership tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainName(String);

impl ChainName {
    pub fn new(name: String) -> Result<Self, FirewallError> {
        let valid = !name.is_empty()
            && name.len() <= MAX_CHAIN_NAME_LENGTH
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid {
            Ok(Self(name))
        } else {
            Err(FirewallError::InvalidChainName(name))
        }
    }

    pub fn for_protected_port(protected_port: u16) -> Result<Self, FirewallError> {
        Self::new(format!("{}{}", CHAIN_PREFIX, protected_port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ownership tag `<chain>:<purpose>`
    fn tag(&self, purpose: &str) -> String {
        format!("{}:{}", self.0, purpose)
    }

    fn owns(&self, rule: &FirewallRule) -> bool {
        rule.tag()
            .and_then(|tag| tag.strip_prefix(self.0.as_str()))
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl std::fmt::Display for ChainName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Translates the set of authorized addresses into packet-filter rules.
///
/// Everything installed lives either in the ownership chain (`nat` table) or carries a comment
/// tagged with the chain name, so teardown and reconciliation never touch foreign rules.
///
/// Unauthorized connections to the protected port are redirected to the knock service; an
/// authorized address gets a `RETURN` rule in front of the redirect and reaches the real service.
pub struct FirewallController {
    backend: Box<dyn FirewallBackend>,
    chain: ChainName,
    service_port: u16,
    protected_port: u16,
}

impl FirewallController {
    pub fn new(
        backend: Box<dyn FirewallBackend>,
        chain: ChainName,
        service_port: u16,
        protected_port: u16,
    ) -> Self {
        Self {
            backend,
            chain,
            service_port,
            protected_port,
        }
    }

    pub fn chain(&self) -> &ChainName {
        &self.chain
    }

    /// The fixed rule program, in installation order
    pub fn static_rules(&self) -> Vec<FirewallRule> {
        let chain = self.chain.as_str();
        let service_port = self.service_port.to_string();
        let service_port = service_port.as_str();
        let protected_port = self.protected_port.to_string();
        let protected_port = protected_port.as_str();
        let both_ports = format!("{},{}", service_port, protected_port);

        vec![
            FirewallRule::tagged(
                Table::Nat,
                chain,
                &["-p", "tcp"],
                &self.chain.tag("redirect"),
                &["REDIRECT", "--to-ports", service_port],
            ),
            FirewallRule::tagged(
                Table::Mangle,
                PREROUTING,
                &[
                    "-p",
                    "tcp",
                    "--dport",
                    protected_port,
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "ESTABLISHED,RELATED",
                ],
                &self.chain.tag("related"),
                &["ACCEPT"],
            ),
            FirewallRule::tagged(
                Table::Mangle,
                PREROUTING,
                &[
                    "-p",
                    "tcp",
                    "--dport",
                    service_port,
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "NEW",
                    "-m",
                    "mark",
                    "!",
                    "--mark",
                    KNOCK_MARK,
                ],
                &self.chain.tag("drop"),
                &["DROP"],
            ),
            FirewallRule::tagged(
                Table::Nat,
                PREROUTING,
                &["-p", "tcp", "--dport", protected_port],
                &self.chain.tag("entry"),
                &[chain],
            ),
            FirewallRule::tagged(
                Table::Mangle,
                PREROUTING,
                &["-p", "tcp", "--dport", protected_port],
                &self.chain.tag("mark"),
                &["MARK", "--set-mark", KNOCK_MARK],
            ),
            FirewallRule::tagged(
                Table::Mangle,
                PREROUTING,
                &["-p", "tcp", "-m", "multiport", "--dports", both_ports.as_str()],
                &self.chain.tag("finish"),
                &["MARK", "--set-mark", "0"],
            ),
        ]
    }

    /// Rule letting `address` bypass the redirect
    pub fn authorized_rule(&self, address: Ipv4Addr) -> FirewallRule {
        let source = format!("{}/32", address);
        FirewallRule::tagged(
            Table::Nat,
            self.chain.as_str(),
            &["-s", source.as_str(), "-p", "tcp"],
            &self.chain.tag(&format!("{}:accept", address)),
            &["RETURN"],
        )
    }

    /// Creates (or clears) the ownership chain and installs the static rule program
    pub async fn setup(&self) -> Result<(), FirewallError> {
        log::info!("Setting up firewall chain {}", self.chain);

        self.backend.create_chain(Table::Nat, self.chain.as_str()).await?;
        for rule in self.static_rules() {
            self.backend.append_unique(&rule).await?;
        }

        Ok(())
    }

    /// Removes every rule tagged with the chain name, then the chain itself.
    ///
    /// Attempts every deletion even if some fail, and returns the last error encountered.
    pub async fn teardown(&self) -> Result<(), FirewallError> {
        log::info!("Tearing down firewall chain {}", self.chain);

        let mut last_error = None;

        for table in [Table::Nat, Table::Mangle] {
            let rules = match self.backend.list_rules(table, PREROUTING).await {
                Ok(rules) => rules,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            for rule in rules.iter().filter(|rule| self.chain.owns(rule)) {
                if let Err(e) = self.backend.delete(rule).await {
                    log::warn!("Failed to remove rule {}: {}", rule, e);
                    last_error = Some(e);
                }
            }
        }

        if let Err(e) = self.backend.delete_chain(Table::Nat, self.chain.as_str()).await {
            log::warn!("Failed to remove chain {}: {}", self.chain, e);
            last_error = Some(e);
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Converges the dynamic allow rules of the ownership chain to `desired`.
    ///
    /// Only rules whose tag names an address are considered; stale ones are deleted and missing
    /// ones inserted at the front of the chain. Every mutation is attempted even if others fail,
    /// the last error is returned.
    pub async fn sync_authorized_ips(
        &self,
        desired: &BTreeSet<Ipv4Addr>,
    ) -> Result<(), FirewallError> {
        let rules = self
            .backend
            .list_rules(Table::Nat, self.chain.as_str())
            .await?;

        let mut installed = BTreeSet::new();
        let mut last_error = None;

        for rule in &rules {
            let Some(address) = self.authorized_address(rule) else {
                continue;
            };

            // Duplicates and rules whose source disagrees with their tag are stale as well
            let consistent = rule.source() == Some(Ipv4Net::from(address));
            if consistent && desired.contains(&address) && installed.insert(address) {
                continue;
            }

            log::debug!("Removing authorization of {}", address);
            if let Err(e) = self.backend.delete(rule).await {
                log::warn!("Failed to remove rule {}: {}", rule, e);
                last_error = Some(e);
            }
        }

        for &address in desired.difference(&installed) {
            log::debug!("Adding authorization of {}", address);
            if let Err(e) = self.backend.insert(&self.authorized_rule(address), 1).await {
                log::warn!("Failed to authorize {}: {}", address, e);
                last_error = Some(e);
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Extracts the address from a tag of the form `<chain>:<address>:accept`
    fn authorized_address(&self, rule: &FirewallRule) -> Option<Ipv4Addr> {
        rule.tag()?
            .strip_prefix(self.chain.as_str())?
            .strip_prefix(':')?
            .split(':')
            .next()?
            .parse()
            .ok()
    }
}
