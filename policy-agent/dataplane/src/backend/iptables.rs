//! Enforces resources with `ipset`, `iptables-restore` and `ip route`.
//!
//! Every logical address set is held as two kernel sets, one per IP family, named `pa4-` or
//! `pa6-` followed by the set's id. Chains are installed in the filter table of both families.
//! The first rule of each chain is a comment carrying the chain's fingerprint and a digest of
//! the rules that follow it, so that the chain can be verified when it is read back. Root chains
//! are only reported as installed while the kernel chain that feeds them still jumps to them.

use super::{ApplyError, BackendError, Dataplane};
use crate::{
    model::{Chain, ChainAction, ChainRule, Match, Observed, Side, CHAIN_PREFIX},
    plan::Op,
    render::{protocol_in_family, FORWARD_CHAIN, INPUT_CHAIN, OUTPUT_CHAIN},
};
use ipnet::IpNet;
use policy_agent_core::{IpSet, Member, Protocol, Route, SetId, SetKind};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    net::IpAddr,
    process::Stdio,
    str::FromStr,
};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

/// Marks the routes the agent owns.
const ROUTE_PROTO: &str = "80";

/// Stands in for the fingerprint of a chain that cannot be verified.
const INVALID: &str = "invalid";

const MAX_SET_SIZE: usize = 1_048_576;

/// The kernel chains each root chain is hooked into.
const HOOKS: [(&str, &str); 3] = [
    ("FORWARD", FORWARD_CHAIN),
    ("INPUT", INPUT_CHAIN),
    ("OUTPUT", OUTPUT_CHAIN),
];

/// The iptables flavor in use on the node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Legacy,
    Nft,
}

#[derive(Clone, Debug)]
pub struct IptablesConfig {
    pub mode: Mode,
    /// The routing table that holds routes to local workloads.
    pub route_table: u32,
}

#[derive(Clone, Debug)]
pub struct IptablesDataplane {
    config: IptablesConfig,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    V4,
    V6,
}

/// Consecutive operations of the same step are applied with one command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Step {
    Sets,
    Chains,
    Routes,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    dev: Option<String>,
}

// === impl Mode ===

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "nft" => Ok(Self::Nft),
            s => Err(format!("invalid iptables mode: {s}")),
        }
    }
}

// === impl Family ===

impl Family {
    const ALL: [Family; 2] = [Family::V4, Family::V6];

    fn of(member: &Member) -> Self {
        if member.is_ipv4() {
            Self::V4
        } else {
            Self::V6
        }
    }

    fn is_v4(&self) -> bool {
        *self == Self::V4
    }

    fn set_name(&self, id: &SetId) -> String {
        let hash = id.as_str().trim_start_matches("s:");
        match self {
            Self::V4 => format!("pa4-{hash}"),
            Self::V6 => format!("pa6-{hash}"),
        }
    }

    fn temp_set_name(&self, id: &SetId) -> String {
        let hash = id.as_str().trim_start_matches("s:");
        match self {
            Self::V4 => format!("pa4t-{hash}"),
            Self::V6 => format!("pa6t-{hash}"),
        }
    }

    fn ipset_family(&self) -> &'static str {
        match self {
            Self::V4 => "inet",
            Self::V6 => "inet6",
        }
    }

    fn iptables(&self, mode: Mode) -> &'static str {
        match (self, mode) {
            (Self::V4, Mode::Legacy) => "iptables-legacy",
            (Self::V4, Mode::Nft) => "iptables-nft",
            (Self::V6, Mode::Legacy) => "ip6tables-legacy",
            (Self::V6, Mode::Nft) => "ip6tables-nft",
        }
    }

    fn restore(&self, mode: Mode) -> &'static str {
        match (self, mode) {
            (Self::V4, Mode::Legacy) => "iptables-legacy-restore",
            (Self::V4, Mode::Nft) => "iptables-nft-restore",
            (Self::V6, Mode::Legacy) => "ip6tables-legacy-restore",
            (Self::V6, Mode::Nft) => "ip6tables-nft-restore",
        }
    }

    fn save(&self, mode: Mode) -> &'static str {
        match (self, mode) {
            (Self::V4, Mode::Legacy) => "iptables-legacy-save",
            (Self::V4, Mode::Nft) => "iptables-nft-save",
            (Self::V6, Mode::Legacy) => "ip6tables-legacy-save",
            (Self::V6, Mode::Nft) => "ip6tables-nft-save",
        }
    }

    fn ip_flag(&self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }

    fn route_family(dst: &IpNet) -> Self {
        match dst {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }
}

// === impl Step ===

impl Step {
    fn of(op: &Op) -> Self {
        match op {
            Op::ReplaceSet { .. } | Op::UpdateSet { .. } | Op::DeleteSet { .. } => Self::Sets,
            Op::ReplaceChain { .. } | Op::DeleteChain { .. } => Self::Chains,
            Op::ReplaceRoute(_) | Op::DeleteRoute(_) => Self::Routes,
        }
    }
}

// === impl IptablesDataplane ===

impl IptablesDataplane {
    pub fn new(config: IptablesConfig) -> Self {
        Self { config }
    }

    async fn apply_sets(&self, ops: &[Op]) -> Result<(), BackendError> {
        let mut existing = BTreeSet::new();
        if ops.iter().any(|op| matches!(op, Op::DeleteSet { .. })) {
            let names = run("ipset", &["list", "-n"], None).await?;
            existing.extend(names.lines().map(|name| name.trim().to_string()));
        }
        let script = ipset_script(ops, &existing);
        run("ipset", &["restore", "-exist"], Some(&script)).await?;
        Ok(())
    }

    async fn apply_chains(&self, ops: &[Op]) -> Result<(), BackendError> {
        for family in Family::ALL {
            let script = restore_script(family, ops);
            run(
                family.restore(self.config.mode),
                &["--noflush", "--wait"],
                Some(&script),
            )
            .await?;
        }

        for (builtin, root) in HOOKS {
            let replaced = ops
                .iter()
                .any(|op| matches!(op, Op::ReplaceChain { name, .. } if name == root));
            if replaced {
                for family in Family::ALL {
                    self.ensure_hook(family, builtin, root).await?;
                }
            }
        }
        Ok(())
    }

    /// Inserts a jump from a kernel chain to a root chain unless it is already present.
    async fn ensure_hook(
        &self,
        family: Family,
        builtin: &str,
        root: &str,
    ) -> Result<(), BackendError> {
        let iptables = family.iptables(self.config.mode);
        let check = run(iptables, &["-w", "-C", builtin, "-j", root], None).await;
        match check {
            Ok(_) => Ok(()),
            Err(BackendError::Command { .. }) => {
                info!(%builtin, %root, family = family.ipset_family(), "Hooking root chain");
                run(iptables, &["-w", "-I", builtin, "1", "-j", root], None).await?;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn apply_route(&self, op: &Op) -> Result<(), BackendError> {
        let table = self.config.route_table.to_string();
        match op {
            Op::ReplaceRoute(route) => {
                let family = Family::route_family(&route.dst);
                let dst = route.dst.to_string();
                run(
                    "ip",
                    &[
                        family.ip_flag(),
                        "route",
                        "replace",
                        &dst,
                        "dev",
                        &route.interface,
                        "proto",
                        ROUTE_PROTO,
                        "table",
                        &table,
                    ],
                    None,
                )
                .await?;
            }
            Op::DeleteRoute(dst) => {
                let family = Family::route_family(dst);
                let dst = dst.to_string();
                let res = run(
                    "ip",
                    &[
                        family.ip_flag(),
                        "route",
                        "del",
                        &dst,
                        "proto",
                        ROUTE_PROTO,
                        "table",
                        &table,
                    ],
                    None,
                )
                .await;
                match res {
                    Err(BackendError::Command { stderr, .. }) if stderr.contains("No such process") => {
                        debug!(%dst, "Route already removed");
                    }
                    res => {
                        res?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn read_routes(&self) -> Result<BTreeMap<IpNet, Route>, BackendError> {
        let table = self.config.route_table.to_string();
        let mut routes = BTreeMap::new();
        for family in Family::ALL {
            let args = [
                "-j",
                family.ip_flag(),
                "route",
                "show",
                "table",
                &table,
                "proto",
                ROUTE_PROTO,
            ];
            let output = run("ip", &args, None).await?;
            routes.extend(parse_routes(&output).map_err(|message| BackendError::Parse {
                command: "ip route show".to_string(),
                message,
            })?);
        }
        Ok(routes)
    }
}

#[async_trait::async_trait]
impl Dataplane for IptablesDataplane {
    async fn apply_batch(&self, ops: &[Op]) -> Result<(), ApplyError> {
        let mut start = 0;
        while start < ops.len() {
            let step = Step::of(&ops[start]);
            let len = ops[start..]
                .iter()
                .take_while(|op| Step::of(op) == step)
                .count();
            let group = &ops[start..start + len];

            match step {
                Step::Sets => self
                    .apply_sets(group)
                    .await
                    .map_err(|source| ApplyError {
                        failed: start,
                        source,
                    })?,
                Step::Chains => self
                    .apply_chains(group)
                    .await
                    .map_err(|source| ApplyError {
                        failed: start,
                        source,
                    })?,
                Step::Routes => {
                    for (i, op) in group.iter().enumerate() {
                        self.apply_route(op).await.map_err(|source| ApplyError {
                            failed: start + i,
                            source,
                        })?;
                    }
                }
            }
            start += len;
        }
        Ok(())
    }

    async fn read_state(&self) -> Result<Observed, BackendError> {
        let sets = run("ipset", &["save"], None).await?;
        let ip_sets = parse_sets(&sets).map_err(|message| BackendError::Parse {
            command: "ipset save".to_string(),
            message,
        })?;

        let mut families = Vec::with_capacity(2);
        for family in Family::ALL {
            let output = run(family.save(self.config.mode), &["-t", "filter"], None).await?;
            families.push(parse_chains(&output));
        }
        let chains = match &families[..] {
            [v4, v6] => merge_chains(v4, v6),
            _ => BTreeMap::new(),
        };

        let routes = self.read_routes().await?;
        Ok(Observed {
            ip_sets,
            chains,
            routes,
        })
    }
}

async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String, BackendError> {
    let command = format!("{program} {}", args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!("{program} is not installed"))
            } else {
                BackendError::Spawn {
                    command: command.clone(),
                    source,
                }
            }
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|source| BackendError::Spawn {
                command: command.clone(),
                source,
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| BackendError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(BackendError::Command {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    String::from_utf8(output.stdout).map_err(|e| BackendError::Parse {
        command,
        message: e.to_string(),
    })
}

// === ipset ===

fn set_type(kind: SetKind) -> &'static str {
    match kind {
        SetKind::Net => "hash:net",
        SetKind::NamedPort => "hash:ip,port",
    }
}

/// The kernel entries for a member. A set of networks cannot hold a zero-length prefix, so it
/// is stored as its two halves.
fn entries(member: &Member) -> Vec<String> {
    match member {
        Member::Net(IpNet::V4(net)) if net.prefix_len() == 0 => {
            vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()]
        }
        Member::Net(IpNet::V6(net)) if net.prefix_len() == 0 => {
            vec!["::/1".to_string(), "8000::/1".to_string()]
        }
        member => vec![member.to_string()],
    }
}

/// Renders the `ipset restore` input for set operations. `existing` names the kernel sets present
/// on the node; destroying any other set would fail the whole restore.
fn ipset_script(ops: &[Op], existing: &BTreeSet<String>) -> String {
    let mut script = String::new();
    for op in ops {
        match op {
            Op::ReplaceSet { id, set } => {
                for family in Family::ALL {
                    let name = family.set_name(id);
                    let temp = family.temp_set_name(id);
                    let header = format!(
                        "{} family {} maxelem {MAX_SET_SIZE}",
                        set_type(set.kind),
                        family.ipset_family()
                    );
                    let _ = writeln!(script, "create {name} {header}");
                    let _ = writeln!(script, "create {temp} {header}");
                    let _ = writeln!(script, "flush {temp}");
                    for member in set.members.iter().filter(|m| Family::of(m) == family) {
                        for entry in entries(member) {
                            let _ = writeln!(script, "add {temp} {entry}");
                        }
                    }
                    let _ = writeln!(script, "swap {temp} {name}");
                    let _ = writeln!(script, "destroy {temp}");
                }
            }
            Op::UpdateSet { id, added, removed } => {
                for member in removed {
                    let name = Family::of(member).set_name(id);
                    for entry in entries(member) {
                        let _ = writeln!(script, "del {name} {entry}");
                    }
                }
                for member in added {
                    let name = Family::of(member).set_name(id);
                    for entry in entries(member) {
                        let _ = writeln!(script, "add {name} {entry}");
                    }
                }
            }
            Op::DeleteSet { id } => {
                for name in Family::ALL.map(|family| family.set_name(id)) {
                    if existing.contains(&name) {
                        let _ = writeln!(script, "destroy {name}");
                    } else {
                        debug!(%name, "Set already removed");
                    }
                }
            }
            _ => {}
        }
    }
    script
}

/// Parses the output of `ipset save` into the agent's logical sets. A set is only reported when
/// both of its family sets exist with the same type.
fn parse_sets(output: &str) -> Result<BTreeMap<SetId, IpSet>, String> {
    let mut families = BTreeMap::<(SetId, Family), IpSet>::new();
    for line in output.lines() {
        let mut words = line.split_whitespace();
        let (Some(verb), Some(name)) = (words.next(), words.next()) else {
            continue;
        };
        let Some((id, family)) = parse_set_name(name) else {
            continue;
        };
        match verb {
            "create" => {
                let kind = match words.next() {
                    Some("hash:net") => SetKind::Net,
                    Some("hash:ip,port") => SetKind::NamedPort,
                    ty => return Err(format!("unexpected type of set {name}: {ty:?}")),
                };
                families.insert(
                    (id, family),
                    IpSet {
                        kind,
                        members: BTreeSet::new(),
                    },
                );
            }
            "add" => {
                let entry = words
                    .next()
                    .ok_or_else(|| format!("missing entry in set {name}"))?;
                let set = families
                    .get_mut(&(id, family))
                    .ok_or_else(|| format!("entry added to undeclared set {name}"))?;
                set.members.insert(parse_entry(set.kind, entry)?);
            }
            _ => {}
        }
    }

    let mut sets = BTreeMap::new();
    let ids = families.keys().map(|(id, _)| id.clone()).collect::<BTreeSet<_>>();
    for id in ids {
        let v4 = families.remove(&(id.clone(), Family::V4));
        let v6 = families.remove(&(id.clone(), Family::V6));
        if let (Some(v4), Some(v6)) = (v4, v6) {
            if v4.kind == v6.kind {
                let mut members = join_halves(v4.members);
                members.extend(join_halves(v6.members));
                sets.insert(
                    id,
                    IpSet {
                        kind: v4.kind,
                        members,
                    },
                );
            }
        }
    }
    Ok(sets)
}

fn parse_set_name(name: &str) -> Option<(SetId, Family)> {
    let (family, hash) = if let Some(hash) = name.strip_prefix("pa4-") {
        (Family::V4, hash)
    } else if let Some(hash) = name.strip_prefix("pa6-") {
        (Family::V6, hash)
    } else {
        return None;
    };
    Some((SetId::from(format!("s:{hash}").as_str()), family))
}

fn parse_entry(kind: SetKind, entry: &str) -> Result<Member, String> {
    match kind {
        SetKind::Net => parse_net(entry).map(Member::Net),
        SetKind::NamedPort => {
            let (addr, port) = entry
                .split_once(',')
                .ok_or_else(|| format!("invalid entry: {entry}"))?;
            let (protocol, port) = port
                .rsplit_once(':')
                .ok_or_else(|| format!("invalid entry: {entry}"))?;
            Ok(Member::NamedPort {
                addr: addr
                    .parse()
                    .map_err(|e| format!("invalid address {addr}: {e}"))?,
                protocol: protocol.parse::<Protocol>()?,
                port: port
                    .parse()
                    .map_err(|e| format!("invalid port {port}: {e}"))?,
            })
        }
    }
}

/// Parses a network, or an address as a host network.
fn parse_net(s: &str) -> Result<IpNet, String> {
    if s.contains('/') {
        s.parse().map_err(|e| format!("invalid network {s}: {e}"))
    } else {
        s.parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|e| format!("invalid address {s}: {e}"))
    }
}

/// Undoes the splitting of zero-length prefixes.
fn join_halves(mut members: BTreeSet<Member>) -> BTreeSet<Member> {
    for (lo, hi, all) in [
        ("0.0.0.0/1", "128.0.0.0/1", "0.0.0.0/0"),
        ("::/1", "8000::/1", "::/0"),
    ] {
        let net = |s: &str| s.parse::<IpNet>().ok().map(Member::Net);
        if let (Some(lo), Some(hi), Some(all)) = (net(lo), net(hi), net(all)) {
            if members.contains(&lo) && members.contains(&hi) {
                members.remove(&lo);
                members.remove(&hi);
                members.insert(all);
            }
        }
    }
    members
}

// === iptables ===

/// Renders the `iptables-restore` input that applies chain operations for one family.
fn restore_script(family: Family, ops: &[Op]) -> String {
    let mut script = String::from("*filter\n");
    // Declaring a chain creates it, or flushes it if it exists.
    for op in ops {
        if let Op::ReplaceChain { name, .. } | Op::DeleteChain { name } = op {
            let _ = writeln!(script, ":{name} - [0:0]");
        }
    }
    for op in ops {
        if let Op::ReplaceChain { name, chain } = op {
            write_chain(&mut script, family, name, chain);
        }
    }
    for op in ops {
        if let Op::DeleteChain { name } = op {
            let _ = writeln!(script, "-X {name}");
        }
    }
    script.push_str("COMMIT\n");
    script
}

fn write_chain(script: &mut String, family: Family, name: &str, chain: &Chain) {
    let rules = chain
        .rules
        .iter()
        .filter(|rule| {
            rule.matches.iter().all(|m| match m {
                Match::Protocol(p) => protocol_in_family(*p, family.is_v4()),
                _ => true,
            })
        })
        .collect::<Vec<_>>();

    let rules = rules
        .into_iter()
        .map(|rule| rule_args(family, rule))
        .collect::<Vec<_>>();
    let _ = writeln!(
        script,
        "-A {name} -m comment --comment \"pa:{}:{}\"",
        chain.fingerprint(),
        rules_digest(rules.iter().map(String::as_str))
    );
    for rule in rules {
        let _ = writeln!(script, "-A {name} {rule}");
    }
}

fn rule_args(family: Family, rule: &ChainRule) -> String {
    // iptables-save prints interface and protocol matches ahead of match modules.
    let (head, modules): (Vec<_>, Vec<_>) = rule.matches.iter().partition(|m| {
        matches!(
            m,
            Match::InInterface(_) | Match::OutInterface(_) | Match::Protocol(_)
        )
    });
    let mut args = Vec::new();
    for m in head.into_iter().chain(modules) {
        let not = |negated: &bool| if *negated { "! " } else { "" };
        args.push(match m {
            Match::InInterface(i) => format!("-i {i}"),
            Match::OutInterface(i) => format!("-o {i}"),
            Match::MarkAll(bits) => format!("-m mark --mark {bits:#x}/{bits:#x}"),
            Match::MarkClear(bits) => format!("-m mark --mark 0x0/{bits:#x}"),
            Match::Protocol(p) => format!("-p {}", iptables_protocol(*p)),
            Match::Set {
                id,
                kind,
                side,
                negated,
            } => {
                let dir = match kind {
                    SetKind::Net => side.as_str().to_string(),
                    SetKind::NamedPort => format!("{0},{0}", side.as_str()),
                };
                format!(
                    "-m set {}--match-set {} {dir}",
                    not(negated),
                    family.set_name(id)
                )
            }
            Match::Ports {
                side,
                ports,
                negated,
            } => {
                let flag = match side {
                    Side::Src => "--sports",
                    Side::Dst => "--dports",
                };
                let ports = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>();
                format!("-m multiport {}{flag} {}", not(negated), ports.join(","))
            }
        });
    }

    args.push(match &rule.action {
        ChainAction::Accept => "-j ACCEPT".to_string(),
        ChainAction::Drop => "-j DROP".to_string(),
        ChainAction::Return => "-j RETURN".to_string(),
        ChainAction::Jump(target) => format!("-j {target}"),
        ChainAction::Goto(target) => format!("-g {target}"),
        ChainAction::SetMark(bits) => format!("-j MARK --set-xmark {bits:#x}/{bits:#x}"),
        ChainAction::ClearMark(bits) => format!("-j MARK --set-xmark 0x0/{bits:#x}"),
        ChainAction::Log(prefix) => format!("-j LOG --log-prefix \"{prefix}\""),
    });
    args.join(" ")
}

fn iptables_protocol(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Icmpv6 => "ipv6-icmp",
        p => p.as_str(),
    }
}

/// Collapses whitespace and drops quoting, which `iptables-save` does not preserve.
fn normalize(args: &str) -> String {
    args.split_whitespace()
        .map(|token| token.trim_matches('"'))
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Digests the arguments of a chain's rules, in order.
fn rules_digest<'a>(rules: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for rule in rules {
        hasher.update(normalize(rule).as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Reads the fingerprint of every agent-owned chain from `iptables-save` output.
///
/// A chain whose rules no longer match its header's digest is reported as invalid, as is a root
/// chain that its kernel chain no longer jumps to.
fn parse_chains(output: &str) -> BTreeMap<String, String> {
    let mut chains = BTreeMap::<&str, Vec<&str>>::new();
    let mut hooked = BTreeSet::new();
    for line in output.lines() {
        if let Some(decl) = line.strip_prefix(':') {
            if let Some(name) = decl.split_whitespace().next() {
                if name.starts_with(CHAIN_PREFIX) {
                    chains.entry(name).or_default();
                }
            }
        } else if let Some(rule) = line.strip_prefix("-A ") {
            let (name, args) = rule.split_once(' ').unwrap_or((rule, ""));
            if name.starts_with(CHAIN_PREFIX) {
                chains.entry(name).or_default().push(args);
            } else if let Some((_, root)) = HOOKS.iter().find(|(builtin, root)| {
                *builtin == name && normalize(args) == format!("-j {root}")
            }) {
                hooked.insert(*root);
            }
        }
    }

    chains
        .into_iter()
        .map(|(name, rules)| {
            let unhooked = HOOKS
                .iter()
                .any(|(_, root)| *root == name && !hooked.contains(root));
            let fp = match rules.split_first() {
                _ if unhooked => INVALID.to_string(),
                Some((header, rest)) => match parse_header(header) {
                    Some((fp, digest)) if digest == rules_digest(rest.iter().copied()) => {
                        fp.to_string()
                    }
                    _ => INVALID.to_string(),
                },
                None => INVALID.to_string(),
            };
            (name.to_string(), fp)
        })
        .collect()
}

/// Parses the fingerprint comment of a chain's first rule into its fingerprint and digest.
fn parse_header(rule: &str) -> Option<(&str, &str)> {
    let (_, comment) = rule.split_once("--comment ")?;
    let comment = comment.trim_start_matches('"');
    let comment = comment.split(['"', ' ']).next()?;
    comment.strip_prefix("pa:")?.split_once(':')
}

/// A chain is verified only if both families hold the same version of it.
fn merge_chains(
    v4: &BTreeMap<String, String>,
    v6: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    v4.keys()
        .chain(v6.keys())
        .map(|name| {
            let fp = match (v4.get(name), v6.get(name)) {
                (Some(a), Some(b)) if a == b => a.clone(),
                _ => INVALID.to_string(),
            };
            (name.clone(), fp)
        })
        .collect()
}

// === routes ===

fn parse_routes(output: &str) -> Result<BTreeMap<IpNet, Route>, String> {
    if output.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let routes = serde_json::from_str::<Vec<IpRoute>>(output).map_err(|e| e.to_string())?;
    let mut out = BTreeMap::new();
    for IpRoute { dst, dev } in routes {
        let Some(dev) = dev else { continue };
        if dst == "default" {
            continue;
        }
        let dst = parse_net(&dst)?;
        out.insert(
            dst,
            Route {
                dst,
                interface: dev,
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ACCEPT_MARK;
    use maplit::btreeset;
    use policy_agent_core::{PortRange, SetDefinition};

    fn id() -> SetId {
        SetDefinition::Selector("role == 'web'".to_string()).id()
    }

    fn net(s: &str) -> Member {
        Member::Net(s.parse().unwrap())
    }

    #[test]
    fn sets_are_swapped_into_place() {
        let id = id();
        let script = ipset_script(
            &[Op::ReplaceSet {
                id: id.clone(),
                set: IpSet {
                    kind: SetKind::Net,
                    members: btreeset![net("10.0.0.1/32"), net("fd00::1/128")],
                },
            }],
            &BTreeSet::new(),
        );
        let v4 = Family::V4.set_name(&id);
        let temp = Family::V4.temp_set_name(&id);
        assert!(v4.len() <= 31, "{v4}");
        assert!(script.contains(&format!("create {v4} hash:net family inet maxelem")));
        assert!(script.contains(&format!("add {temp} 10.0.0.1/32\n")));
        assert!(script.contains(&format!("swap {temp} {v4}\n")));
        assert!(script.contains(&format!("add {} fd00::1/128\n", Family::V6.temp_set_name(&id))));
        assert!(!script.contains(&format!("add {temp} fd00::1/128")));
    }

    #[test]
    fn only_present_sets_are_destroyed() {
        let id = id();
        let v4 = Family::V4.set_name(&id);
        let v6 = Family::V6.set_name(&id);
        let ops = [Op::DeleteSet { id }];

        let script = ipset_script(&ops, &btreeset![v6.clone(), "unrelated".to_string()]);
        assert_eq!(script, format!("destroy {v6}\n"));

        assert!(ipset_script(&ops, &BTreeSet::new()).is_empty());
        assert_eq!(
            ipset_script(&ops, &btreeset![v4.clone(), v6.clone()]),
            format!("destroy {v4}\ndestroy {v6}\n")
        );
    }

    #[test]
    fn saved_sets_are_read_back() {
        let id = id();
        let output = format!(
            "create {v4} hash:net family inet hashsize 1024 maxelem 1048576\n\
             add {v4} 10.0.0.1\n\
             add {v4} 0.0.0.0/1\n\
             add {v4} 128.0.0.0/1\n\
             create {v6} hash:net family inet6 hashsize 1024 maxelem 1048576\n\
             add {v6} fd00::/64\n\
             create other hash:ip family inet\n\
             add other 1.1.1.1\n",
            v4 = Family::V4.set_name(&id),
            v6 = Family::V6.set_name(&id),
        );
        let sets = parse_sets(&output).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(
            sets[&id].members,
            btreeset![net("10.0.0.1/32"), net("0.0.0.0/0"), net("fd00::/64")]
        );
    }

    #[test]
    fn sets_missing_a_family_are_not_reported() {
        let id = id();
        let output = format!(
            "create {v4} hash:ip,port family inet\nadd {v4} 10.0.0.1,tcp:8080\n",
            v4 = Family::V4.set_name(&id),
        );
        assert!(parse_sets(&output).unwrap().is_empty());
        assert_eq!(
            parse_entry(SetKind::NamedPort, "10.0.0.1,tcp:8080").unwrap(),
            Member::NamedPort {
                addr: "10.0.0.1".parse().unwrap(),
                protocol: Protocol::Tcp,
                port: 8080,
            }
        );
    }

    #[test]
    fn chains_render_per_family() {
        let chain = Chain::new(vec![
            ChainRule::new(
                vec![Match::Protocol(Protocol::Icmp)],
                ChainAction::SetMark(ACCEPT_MARK),
            ),
            ChainRule::new(
                vec![
                    Match::Protocol(Protocol::Tcp),
                    Match::Set {
                        id: id(),
                        kind: SetKind::Net,
                        side: Side::Src,
                        negated: true,
                    },
                    Match::Ports {
                        side: Side::Dst,
                        ports: vec![PortRange::single(80), PortRange { first: 8000, last: 8080 }],
                        negated: false,
                    },
                ],
                ChainAction::Drop,
            ),
        ]);
        let ops = [
            Op::ReplaceChain {
                name: "pa-pi-a".to_string(),
                chain: chain.clone(),
            },
            Op::DeleteChain {
                name: "pa-pi-b".to_string(),
            },
        ];

        let v4 = restore_script(Family::V4, &ops);
        let fp = chain.fingerprint();
        let rules = [
            "-p icmp -j MARK --set-xmark 0x10000/0x10000".to_string(),
            format!(
                "-p tcp -m set ! --match-set {} src -m multiport --dports 80,8000:8080 -j DROP",
                Family::V4.set_name(&id())
            ),
        ];
        let digest = rules_digest(rules.iter().map(String::as_str));
        assert_eq!(digest.len(), 16);
        assert_eq!(
            v4,
            format!(
                "*filter\n\
                 :pa-pi-a - [0:0]\n\
                 :pa-pi-b - [0:0]\n\
                 -A pa-pi-a -m comment --comment \"pa:{fp}:{digest}\"\n\
                 -A pa-pi-a {}\n\
                 -A pa-pi-a {}\n\
                 -X pa-pi-b\n\
                 COMMIT\n",
                rules[0], rules[1],
            )
        );

        let v6 = restore_script(Family::V6, &ops);
        assert!(v6.contains(&format!("--comment \"pa:{fp}:")));
        assert!(!v6.contains(&digest));
        assert!(!v6.contains("-p icmp"));
        assert!(v6.contains(&Family::V6.set_name(&id())));
    }

    #[test]
    fn saved_chains_are_verified() {
        let fp = Chain::default().fingerprint();
        let empty = rules_digest(std::iter::empty::<&str>());
        let output = format!(
            "*filter\n\
             :INPUT ACCEPT [0:0]\n\
             :pa-pi-a - [0:0]\n\
             :pa-pi-b - [0:0]\n\
             :pa-pi-c - [0:0]\n\
             -A INPUT -j pa-INPUT\n\
             -A pa-pi-a -m comment --comment \"pa:{fp}:{empty}\"\n\
             -A pa-pi-b -m comment --comment pa:{fp}:{empty}\n\
             -A pa-pi-b -j DROP\n\
             COMMIT\n"
        );
        let chains = parse_chains(&output);
        assert_eq!(chains.len(), 3);
        assert_eq!(chains["pa-pi-a"], fp);
        // A rule was added behind the agent's back.
        assert_eq!(chains["pa-pi-b"], INVALID);
        // The header is missing.
        assert_eq!(chains["pa-pi-c"], INVALID);

        let mut v6 = chains.clone();
        v6.remove("pa-pi-a");
        let merged = merge_chains(&chains, &v6);
        assert_eq!(merged["pa-pi-a"], INVALID);
    }

    /// Renders a chain the way `iptables-save` would print it back.
    fn saved(name: &str, chain: &Chain) -> String {
        let mut script = String::new();
        write_chain(&mut script, Family::V4, name, chain);
        format!("*filter\n:{name} - [0:0]\n{script}COMMIT\n")
    }

    #[test]
    fn rules_edited_in_place_are_detected() {
        let chain = Chain::new(vec![
            ChainRule::new(vec![Match::Protocol(Protocol::Tcp)], ChainAction::Accept),
            ChainRule::always(ChainAction::Drop),
        ]);
        let output = saved("pa-pi-a", &chain);
        assert_eq!(parse_chains(&output)["pa-pi-a"], chain.fingerprint());

        // Spacing and quoting differences are not edits.
        let respaced = output.replace("-p tcp -j ACCEPT", "-p  tcp   -j \"ACCEPT\"");
        assert_eq!(parse_chains(&respaced)["pa-pi-a"], chain.fingerprint());

        // The same number of rules, but one now accepts what it dropped.
        let edited = output.replace("-A pa-pi-a -j DROP", "-A pa-pi-a -j ACCEPT");
        assert_ne!(edited, output);
        assert_eq!(parse_chains(&edited)["pa-pi-a"], INVALID);

        let reordered = output.replace(
            "-A pa-pi-a -p tcp -j ACCEPT\n-A pa-pi-a -j DROP",
            "-A pa-pi-a -j DROP\n-A pa-pi-a -p tcp -j ACCEPT",
        );
        assert_ne!(reordered, output);
        assert_eq!(parse_chains(&reordered)["pa-pi-a"], INVALID);
    }

    #[test]
    fn unhooked_root_chains_are_invalid() {
        let chain = Chain::new(vec![ChainRule::always(ChainAction::Return)]);
        let fp = chain.fingerprint();
        let root = saved(INPUT_CHAIN, &chain);
        assert_eq!(parse_chains(&root)[INPUT_CHAIN], INVALID);

        let hooked = root.replace(
            "COMMIT\n",
            &format!("-A INPUT -j {INPUT_CHAIN}\nCOMMIT\n"),
        );
        assert_eq!(parse_chains(&hooked)[INPUT_CHAIN], fp);

        // A jump from the wrong kernel chain does not count.
        let misplaced = root.replace(
            "COMMIT\n",
            &format!("-A OUTPUT -j {INPUT_CHAIN}\nCOMMIT\n"),
        );
        assert_eq!(parse_chains(&misplaced)[INPUT_CHAIN], INVALID);

        // Chains that are not hooked directly are unaffected.
        assert_eq!(parse_chains(&saved("pa-pi-a", &chain))["pa-pi-a"], fp);
    }

    #[test]
    fn routes_are_read_from_json() {
        let output = r#"[
            {"dst":"10.0.0.1","dev":"cali-a","protocol":"80","scope":"link","flags":[]},
            {"dst":"10.1.0.0/24","dev":"cali-b","protocol":"80","flags":[]},
            {"dst":"default","gateway":"10.0.0.254","dev":"eth0","flags":[]}
        ]"#;
        let routes = parse_routes(output).unwrap();
        let dst = "10.0.0.1/32".parse().unwrap();
        assert_eq!(
            routes[&dst],
            Route {
                dst,
                interface: "cali-a".to_string(),
            }
        );
        assert_eq!(routes.len(), 2);
        assert!(parse_routes("").unwrap().is_empty());
    }

    #[test]
    fn modes() {
        assert_eq!("nft".parse::<Mode>(), Ok(Mode::Nft));
        assert!("xtables".parse::<Mode>().is_err());
        assert_eq!(Family::V6.restore(Mode::Nft), "ip6tables-nft-restore");
    }
}
