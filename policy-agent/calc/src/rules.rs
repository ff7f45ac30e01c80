//! Validation and conversion of policy rules.
//!
//! Every selector, network list and named port a rule refers to is turned into an address set
//! definition, so that rules only ever refer to sets by id.

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use policy_agent_core::{
    EntityMatch, ParsedRule, PolicyRules, PortRange, Protocol, RuleAction, SetDefinition, SetId,
};
use policy_agent_k8s_api::{
    policy::{self as api, Action, EntityRule, Port, Rule},
    Selector, NAMESPACE_LABEL,
};
use std::collections::{BTreeMap, BTreeSet};

/// A policy's or profile's rules along with the address sets they refer to.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ParsedPolicy {
    pub rules: PolicyRules,
    pub sets: BTreeMap<SetId, SetSource>,
}

/// An address set definition, with its selector (if any) in parsed form.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SetSource {
    pub def: SetDefinition,
    pub selector: Option<Selector>,
}

enum PortSpec {
    Range(PortRange),
    Named(String),
}

/// Restricts a selector to endpoints in `namespace`, if set.
pub(crate) fn scope_selector(selector: Selector, namespace: Option<&str>) -> Selector {
    match namespace {
        Some(ns) => Selector::eq(NAMESPACE_LABEL, ns).and(&selector),
        None => selector,
    }
}

/// Parses an optional selector. Unset selectors select everything.
pub(crate) fn parse_selector(selector: Option<&str>, namespace: Option<&str>) -> Result<Selector> {
    let selector = match selector {
        Some(s) => Selector::parse(s)?,
        None => Selector::all(),
    };
    Ok(scope_selector(selector, namespace))
}

/// Converts the rules of a policy or profile.
///
/// Selectors in the rules of a namespaced policy only select endpoints in the policy's namespace.
pub(crate) fn convert(
    namespace: Option<&str>,
    ingress: Option<&[Rule]>,
    egress: Option<&[Rule]>,
) -> Result<ParsedPolicy> {
    let mut sets = BTreeMap::new();
    let mut convert_all = |rules: Option<&[Rule]>, direction: &str| {
        rules
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                convert_rule(namespace, rule, &mut sets)
                    .with_context(|| format!("invalid {direction} rule {i}"))
            })
            .collect::<Result<Vec<_>>>()
    };
    let ingress = convert_all(ingress, "ingress")?;
    let egress = convert_all(egress, "egress")?;
    Ok(ParsedPolicy {
        rules: PolicyRules { ingress, egress },
        sets,
    })
}

fn convert_rule(
    namespace: Option<&str>,
    rule: &Rule,
    sets: &mut BTreeMap<SetId, SetSource>,
) -> Result<ParsedRule> {
    let protocol = rule.protocol.map(convert_protocol);
    let action = match rule.action {
        Action::Allow => RuleAction::Allow,
        Action::Deny => RuleAction::Deny,
        Action::Log => RuleAction::Log,
        Action::Pass => RuleAction::Pass,
    };
    let src = convert_entity(namespace, protocol, rule.source.as_ref(), sets)
        .context("invalid source")?;
    let dst = convert_entity(namespace, protocol, rule.destination.as_ref(), sets)
        .context("invalid destination")?;
    Ok(ParsedRule {
        action,
        protocol,
        src,
        dst,
    })
}

fn convert_entity(
    namespace: Option<&str>,
    protocol: Option<Protocol>,
    entity: Option<&EntityRule>,
    sets: &mut BTreeMap<SetId, SetSource>,
) -> Result<EntityMatch> {
    let Some(entity) = entity else {
        return Ok(EntityMatch::default());
    };

    let mut register = |def: SetDefinition, selector: Option<Selector>| {
        let id = def.id();
        sets.entry(id.clone())
            .or_insert(SetSource { def, selector });
        id
    };

    let mut m = EntityMatch::default();

    // Named ports are resolved against the endpoints the rule selects, or against every endpoint
    // (in the policy's namespace) when the rule has no selector.
    let selector = entity
        .selector
        .as_deref()
        .map(|s| parse_selector(Some(s), namespace))
        .transpose()?;
    let port_selector = selector
        .clone()
        .unwrap_or_else(|| scope_selector(Selector::all(), namespace));

    if let Some(sel) = selector {
        m.sets.push(register(
            SetDefinition::Selector(sel.canonical().to_string()),
            Some(sel),
        ));
    }
    if let Some(s) = entity.not_selector.as_deref() {
        let sel = parse_selector(Some(s), namespace)?;
        m.not_sets.push(register(
            SetDefinition::Selector(sel.canonical().to_string()),
            Some(sel),
        ));
    }
    if let Some(nets) = parse_nets(entity.nets.as_deref())? {
        m.sets.push(register(SetDefinition::Cidrs(nets), None));
    }
    if let Some(nets) = parse_nets(entity.not_nets.as_deref())? {
        m.not_sets.push(register(SetDefinition::Cidrs(nets), None));
    }

    let mut named_port = |protocol: Protocol, name: String| {
        register(
            SetDefinition::NamedPort {
                protocol,
                name,
                selector: port_selector.canonical().to_string(),
            },
            Some(port_selector.clone()),
        )
    };

    for (ports, ranges, named) in [
        (
            entity.ports.as_deref(),
            &mut m.ports,
            &mut m.named_port_sets,
        ),
        (
            entity.not_ports.as_deref(),
            &mut m.not_ports,
            &mut m.not_named_port_sets,
        ),
    ] {
        let ports = ports.unwrap_or_default();
        if ports.is_empty() {
            continue;
        }
        let protocol = match protocol {
            Some(p) if p.has_ports() => p,
            _ => bail!("ports require the tcp, udp or sctp protocol"),
        };
        for port in ports {
            match parse_port(port)? {
                PortSpec::Range(r) => ranges.push(r),
                PortSpec::Named(name) => named.push(named_port(protocol, name)),
            }
        }
    }

    Ok(m)
}

fn convert_protocol(protocol: api::Protocol) -> Protocol {
    match protocol {
        api::Protocol::Tcp => Protocol::Tcp,
        api::Protocol::Udp => Protocol::Udp,
        api::Protocol::Sctp => Protocol::Sctp,
        api::Protocol::Icmp => Protocol::Icmp,
        api::Protocol::Icmpv6 => Protocol::Icmpv6,
    }
}

/// Parses a list of networks. Bare addresses are treated as host networks.
pub(crate) fn parse_nets(nets: Option<&[String]>) -> Result<Option<BTreeSet<IpNet>>> {
    let nets = nets.unwrap_or_default();
    if nets.is_empty() {
        return Ok(None);
    }
    nets.iter()
        .map(|n| parse_net(n))
        .collect::<Result<BTreeSet<_>>>()
        .map(Some)
}

pub(crate) fn parse_net(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    match s.parse::<std::net::IpAddr>() {
        Ok(addr) => Ok(IpNet::from(addr)),
        Err(_) => bail!("invalid network: {s:?}"),
    }
}

fn parse_port(port: &Port) -> Result<PortSpec> {
    match port {
        Port::Number(n) => Ok(PortSpec::Range(PortRange::single(*n))),
        Port::Name(s) => {
            if let Some((first, last)) = s.split_once(':') {
                let first = first
                    .parse::<u16>()
                    .with_context(|| format!("invalid port range: {s:?}"))?;
                let last = last
                    .parse::<u16>()
                    .with_context(|| format!("invalid port range: {s:?}"))?;
                if first > last {
                    bail!("invalid port range: {s:?}");
                }
                return Ok(PortSpec::Range(PortRange { first, last }));
            }
            if let Ok(n) = s.parse::<u16>() {
                return Ok(PortSpec::Range(PortRange::single(n)));
            }
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                bail!("invalid port name: {s:?}");
            }
            Ok(PortSpec::Named(s.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(protocol: Option<api::Protocol>, destination: EntityRule) -> Rule {
        Rule {
            action: Action::Allow,
            protocol,
            source: None,
            destination: Some(destination),
        }
    }

    #[test]
    fn selectors_and_nets_become_sets() {
        let ingress = vec![Rule {
            action: Action::Deny,
            protocol: None,
            source: Some(EntityRule {
                selector: Some("role == 'trusted'".to_string()),
                not_nets: Some(vec!["10.1.0.0/16".to_string(), "10.2.3.4".to_string()]),
                ..Default::default()
            }),
            destination: None,
        }];
        let parsed = convert(None, Some(ingress.as_slice()), None).unwrap();
        assert_eq!(parsed.sets.len(), 2);

        let rule = &parsed.rules.ingress[0];
        assert_eq!(rule.action, RuleAction::Deny);
        assert_eq!(rule.src.sets.len(), 1);
        assert_eq!(rule.src.not_sets.len(), 1);
        let src = &parsed.sets[&rule.src.sets[0]];
        assert_eq!(
            src.def,
            SetDefinition::Selector("role == \"trusted\"".to_string())
        );
        match &parsed.sets[&rule.src.not_sets[0]].def {
            SetDefinition::Cidrs(nets) => {
                assert!(nets.contains(&"10.2.3.4/32".parse().unwrap()));
            }
            def => panic!("unexpected definition: {def:?}"),
        }
    }

    #[test]
    fn namespaced_selectors_are_scoped() {
        let ingress = vec![Rule {
            source: Some(EntityRule {
                selector: Some("role == 'web'".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let parsed = convert(Some("ns-a"), Some(ingress.as_slice()), None).unwrap();
        let id = &parsed.rules.ingress[0].src.sets[0];
        let sel = parsed.sets[id].selector.as_ref().unwrap();
        assert_eq!(
            sel.canonical(),
            "(netpol.io/namespace == \"ns-a\" && role == \"web\")"
        );
    }

    #[test]
    fn ports() {
        let egress = vec![rule(
            Some(api::Protocol::Tcp),
            EntityRule {
                ports: Some(vec![
                    Port::Number(80),
                    Port::Name("8000:8080".to_string()),
                    Port::Name("443".to_string()),
                    Port::Name("metrics".to_string()),
                ]),
                ..Default::default()
            },
        )];
        let parsed = convert(None, None, Some(egress.as_slice())).unwrap();
        let dst = &parsed.rules.egress[0].dst;
        assert_eq!(
            dst.ports,
            vec![
                PortRange::single(80),
                PortRange {
                    first: 8000,
                    last: 8080
                },
                PortRange::single(443),
            ]
        );
        assert_eq!(dst.named_port_sets.len(), 1);
        assert_eq!(
            parsed.sets[&dst.named_port_sets[0]].def,
            SetDefinition::NamedPort {
                protocol: Protocol::Tcp,
                name: "metrics".to_string(),
                selector: "all()".to_string(),
            }
        );
    }

    #[test]
    fn rejects_invalid_rules() {
        for (protocol, entity) in [
            (
                None,
                EntityRule {
                    ports: Some(vec![Port::Number(80)]),
                    ..Default::default()
                },
            ),
            (
                Some(api::Protocol::Icmp),
                EntityRule {
                    ports: Some(vec![Port::Number(80)]),
                    ..Default::default()
                },
            ),
            (
                Some(api::Protocol::Tcp),
                EntityRule {
                    ports: Some(vec![Port::Name("90:80".to_string())]),
                    ..Default::default()
                },
            ),
            (
                None,
                EntityRule {
                    selector: Some("role ==".to_string()),
                    ..Default::default()
                },
            ),
            (
                None,
                EntityRule {
                    nets: Some(vec!["10.0.0.0/33".to_string()]),
                    ..Default::default()
                },
            ),
        ] {
            let rules = vec![rule(protocol, entity)];
            assert!(convert(None, Some(rules.as_slice()), None).is_err(), "{rules:?}");
        }
    }

    #[test]
    fn shared_definitions_share_sets() {
        let entity = EntityRule {
            selector: Some("app == 'db'".to_string()),
            ..Default::default()
        };
        let rules = vec![
            rule(None, entity.clone()),
            Rule {
                action: Action::Deny,
                ..rule(None, entity)
            },
        ];
        let parsed = convert(None, Some(rules.as_slice()), Some(rules.as_slice())).unwrap();
        assert_eq!(parsed.sets.len(), 1);
        assert_eq!(parsed.rules.set_ids().len(), 1);
    }
}
