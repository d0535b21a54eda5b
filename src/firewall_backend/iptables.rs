use crate::firewall_backend::{BackendFuture, FirewallBackend, FirewallError, FirewallRule, Table};
use std::process::Output;

const IPTABLES: &str = "/usr/sbin/iptables";

/// Exit status of `iptables -C` when the rule does not exist
const CHECK_RULE_MISSING: i32 = 1;

/// Drives the IPv4 packet filter through the `iptables` command line tool
pub struct IptablesFirewallBackend {
    program: &'static str,
}

impl IptablesFirewallBackend {
    pub async fn new() -> Result<Self, FirewallError> {
        let backend = Self { program: IPTABLES };

        // Listing needs the same privileges as modifying, and fails early if a table is unavailable
        for table in [Table::Nat, Table::Mangle] {
            backend.list_rules(table, "PREROUTING").await?;
        }

        log::info!("Using iptables backend ({})", backend.program);
        Ok(backend)
    }

    async fn output(&self, args: &[&str]) -> Result<Output, FirewallError> {
        tokio::process::Command::new(self.program)
            .arg("-w")
            .args(args)
            .output()
            .await
            .map_err(|source| {
                log::error!("Failed to start {}: {}", self.program, source);
                FirewallError::Spawn {
                    program: self.program,
                    source,
                }
            })
    }

    /// Runs iptables, returning its standard output on success
    async fn run(&self, args: &[&str]) -> Result<String, FirewallError> {
        let output = self.output(args).await?;
        Self::handle_process_output(self.program, args, output)
    }

    fn handle_process_output(
        program: &str,
        args: &[&str],
        output: Output,
    ) -> Result<String, FirewallError> {
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let error = FirewallError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            reason: format!(
                "[{}] {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            ),
        };
        log::error!("{}", error);
        Err(error)
    }

    fn rule_args<'a>(
        operation: &'a str,
        rule: &'a FirewallRule,
        position: Option<&'a str>,
    ) -> Vec<&'a str> {
        let mut args = vec!["-t", rule.table.name(), operation, rule.chain.as_str()];
        args.extend(position);
        args.extend(rule.args.iter().map(String::as_str));
        args
    }
}

impl FirewallBackend for IptablesFirewallBackend {
    fn create_chain<'a>(&'a self, table: Table, chain: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            // Fails if the chain already exists, which is fine: it is flushed below
            let created = self.output(&["-t", table.name(), "-N", chain]).await?;
            if !created.status.success() {
                log::debug!("Chain {} already exists in table {}, flushing", chain, table);
            }
            self.run(&["-t", table.name(), "-F", chain]).await?;
            Ok(())
        })
    }

    fn delete_chain<'a>(&'a self, table: Table, chain: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.run(&["-t", table.name(), "-F", chain]).await?;
            self.run(&["-t", table.name(), "-X", chain]).await?;
            Ok(())
        })
    }

    fn list_rules<'a>(
        &'a self,
        table: Table,
        chain: &'a str,
    ) -> BackendFuture<'a, Vec<FirewallRule>> {
        Box::pin(async move {
            let listing = self.run(&["-t", table.name(), "-S", chain]).await?;
            Ok(parse_rule_listing(table, chain, &listing))
        })
    }

    fn append_unique<'a>(&'a self, rule: &'a FirewallRule) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let check = self.output(&Self::rule_args("-C", rule, None)).await?;
            match check.status.code() {
                Some(0) => {
                    log::debug!("Rule already present: {}", rule);
                    Ok(())
                }
                Some(CHECK_RULE_MISSING) => {
                    self.run(&Self::rule_args("-A", rule, None)).await?;
                    Ok(())
                }
                _ => Self::handle_process_output(
                    self.program,
                    &Self::rule_args("-C", rule, None),
                    check,
                )
                .map(|_| ()),
            }
        })
    }

    fn insert<'a>(&'a self, rule: &'a FirewallRule, position: u32) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let position = position.to_string();
            self.run(&Self::rule_args("-I", rule, Some(position.as_str()))).await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, rule: &'a FirewallRule) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.run(&Self::rule_args("-D", rule, None)).await?;
            Ok(())
        })
    }
}

/// Parses the output of `iptables -S <chain>`. Lines that are not rules of `chain` are skipped.
fn parse_rule_listing(table: Table, chain: &str, listing: &str) -> Vec<FirewallRule> {
    let mut rules = Vec::new();

    for line in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some(tokens) = shlex::split(line) else {
            log::warn!("Ignoring malformed line in listing of {} {}: {}", table, chain, line);
            continue;
        };

        match tokens.first().map(String::as_str) {
            // Comments, chain declarations and policies
            None | Some("-N") | Some("-P") => continue,
            Some("-A") if tokens.get(1).map(String::as_str) == Some(chain) => {
                rules.push(FirewallRule {
                    table,
                    chain: chain.to_owned(),
                    args: tokens[2..].to_vec(),
                });
            }
            _ => {
                log::warn!("Ignoring unexpected line in listing of {} {}: {}", table, chain, line);
            }
        }
    }

    rules
}
