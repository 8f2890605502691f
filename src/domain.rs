//! Domain flow resolution.
//!
//! Every port carries a domain tag naming the kind of memory it expects.
//! Before a topology goes live the resolver looks at each fan-out group
//! (one source, its destinations) and each fan-in group (one destination,
//! its sources) and asks both sides how they want to provision buffers for
//! the other side's domain. Groups that cannot share one pool get a bridge
//! block spliced in.
//!
//! Resolution runs in two phases. [`DomainFlowResolver::judge`] performs
//! every query and produces a [`Verdict`]; only then does
//! [`Verdict::apply`] create bridges. A failed query therefore aborts
//! before anything was instantiated.

use crate::invariant_ppt::{assert_invariant, DOMAIN_SINGLE_BRIDGE};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// How a port wants buffers provisioned for a given peer domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferMode {
    /// No requirement; adapts to the other side.
    Abdicate,
    /// Supplies or needs its own pool.
    Custom,
    /// Cannot work with that domain at all.
    Error,
}

impl BufferMode {
    /// Wire name (`"ABDICATE"`, `"CUSTOM"`, `"ERROR"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferMode::Abdicate => "ABDICATE",
            BufferMode::Custom => "CUSTOM",
            BufferMode::Error => "ERROR",
        }
    }
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BufferMode {
    type Err = DomainResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABDICATE" => Ok(BufferMode::Abdicate),
            "CUSTOM" => Ok(BufferMode::Custom),
            "ERROR" => Ok(BufferMode::Error),
            other => Err(DomainResolutionError::UnknownMode(other.to_string())),
        }
    }
}

/// Resolution failures. Any of them aborts the whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainResolutionError {
    #[error("domain query for {port} failed: {reason}")]
    Query { port: String, reason: String },
    #[error("unrecognized buffer mode {0:?}")]
    UnknownMode(String),
    #[error("bridge creation failed: {0}")]
    Bridge(String),
}

/// One edge of a flattened topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Flow<P> {
    /// Output side.
    pub src: P,
    /// Input side.
    pub dst: P,
}

impl<P> Flow<P> {
    pub fn new(src: P, dst: P) -> Self {
        Self { src, dst }
    }
}

/// Answers domain and buffer-mode questions about ports.
pub trait DomainQuery {
    /// Port identifier.
    type Port: Clone + Eq + Hash + fmt::Debug;

    /// Domain tag of `port`; empty for host memory.
    fn domain(&mut self, port: &Self::Port, is_input: bool) -> Result<String, DomainResolutionError>;

    /// Provisioning mode of `port` towards a peer in `domain`.
    fn buffer_mode(
        &mut self,
        port: &Self::Port,
        domain: &str,
        is_input: bool,
    ) -> Result<BufferMode, DomainResolutionError>;

    /// Ports of previously inserted bridges are always acceptable.
    fn is_bridge(&self, _port: &Self::Port) -> bool {
        false
    }
}

/// Creates bridge blocks on demand.
pub trait BridgeSource {
    /// Port identifier, matching the query's.
    type Port;

    /// Instantiate a bridge and return its (input, output) ports.
    fn create_bridge(&mut self) -> Result<(Self::Port, Self::Port), DomainResolutionError>;
}

/// Ports judged unacceptable, awaiting bridges.
#[derive(Debug, Clone)]
pub struct Verdict<P> {
    bad_sources: HashSet<P>,
    bad_destinations: HashSet<P>,
}

/// Rewritten flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<P> {
    /// Domain-safe edge list, without duplicates.
    pub flows: Vec<Flow<P>>,
    /// Bridges created for this resolution.
    pub bridges: usize,
}

impl<P: Clone + Eq + Hash + fmt::Debug> Verdict<P> {
    /// True when no bridge is needed.
    pub fn is_clean(&self) -> bool {
        self.bad_sources.is_empty() && self.bad_destinations.is_empty()
    }

    /// Sources that need a bridge.
    pub fn bad_sources(&self) -> impl Iterator<Item = &P> {
        self.bad_sources.iter()
    }

    /// Destinations that need a bridge.
    pub fn bad_destinations(&self) -> impl Iterator<Item = &P> {
        self.bad_destinations.iter()
    }

    /// Create one bridge per unacceptable port and reroute its flows.
    pub fn apply<B>(self, flows: &[Flow<P>], source: &mut B) -> Result<Resolution<P>, DomainResolutionError>
    where
        B: BridgeSource<Port = P>,
    {
        let mut src_bridges: HashMap<P, (P, P)> = HashMap::new();
        let mut dst_bridges: HashMap<P, (P, P)> = HashMap::new();
        let mut out: Vec<Flow<P>> = Vec::with_capacity(flows.len());
        let mut created = 0;

        for flow in flows {
            let src_bridge = if self.bad_sources.contains(&flow.src) {
                if !src_bridges.contains_key(&flow.src) {
                    src_bridges.insert(flow.src.clone(), source.create_bridge()?);
                    created += 1;
                }
                src_bridges.get(&flow.src).cloned()
            } else {
                None
            };
            let dst_bridge = if self.bad_destinations.contains(&flow.dst) {
                if !dst_bridges.contains_key(&flow.dst) {
                    dst_bridges.insert(flow.dst.clone(), source.create_bridge()?);
                    created += 1;
                }
                dst_bridges.get(&flow.dst).cloned()
            } else {
                None
            };

            match (src_bridge, dst_bridge) {
                (None, None) => push_unique(&mut out, flow.clone()),
                (Some((input, output)), None) | (None, Some((input, output))) => {
                    push_unique(&mut out, Flow::new(flow.src.clone(), input));
                    push_unique(&mut out, Flow::new(output, flow.dst.clone()));
                }
                (Some((s_in, s_out)), Some((d_in, d_out))) => {
                    push_unique(&mut out, Flow::new(flow.src.clone(), s_in));
                    push_unique(&mut out, Flow::new(s_out, d_in));
                    push_unique(&mut out, Flow::new(d_out, flow.dst.clone()));
                }
            }
        }

        assert_invariant(
            DOMAIN_SINGLE_BRIDGE,
            created == self.bad_sources.len() + self.bad_destinations.len(),
            "one bridge per unacceptable port",
            None,
        );
        Ok(Resolution {
            flows: out,
            bridges: created,
        })
    }
}

fn push_unique<P: PartialEq>(flows: &mut Vec<Flow<P>>, flow: Flow<P>) {
    if !flows.contains(&flow) {
        flows.push(flow);
    }
}

/// Port plus the opposite-side ports it shares edges with.
type Group<P> = (P, Vec<P>);

fn groups<P: Clone + Eq + Hash>(flows: &[Flow<P>]) -> (Vec<Group<P>>, Vec<Group<P>>) {
    let mut sources: Vec<Group<P>> = Vec::new();
    let mut destinations: Vec<Group<P>> = Vec::new();
    for flow in flows {
        add_member(&mut sources, &flow.src, &flow.dst);
        add_member(&mut destinations, &flow.dst, &flow.src);
    }
    (sources, destinations)
}

fn add_member<P: Clone + Eq>(groups: &mut Vec<Group<P>>, main: &P, member: &P) {
    match groups.iter_mut().find(|(port, _)| port == main) {
        Some((_, members)) => {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }
        None => groups.push((main.clone(), vec![member.clone()])),
    }
}

/// Inserts bridges where adjacent ports cannot share buffers.
pub struct DomainFlowResolver<Q: DomainQuery> {
    query: Q,
    modes: HashMap<(Q::Port, bool, String), BufferMode>,
    domains: HashMap<(Q::Port, bool), String>,
}

impl<Q: DomainQuery> DomainFlowResolver<Q> {
    pub fn new(query: Q) -> Self {
        Self {
            query,
            modes: HashMap::new(),
            domains: HashMap::new(),
        }
    }

    /// The wrapped query.
    pub fn query(&self) -> &Q {
        &self.query
    }

    /// Unwrap the query.
    pub fn into_query(self) -> Q {
        self.query
    }

    /// Forget cached answers.
    pub fn clear_cache(&mut self) {
        self.modes.clear();
        self.domains.clear();
    }

    fn domain_of(&mut self, port: &Q::Port, is_input: bool) -> Result<String, DomainResolutionError> {
        let key = (port.clone(), is_input);
        if let Some(domain) = self.domains.get(&key) {
            return Ok(domain.clone());
        }
        let domain = self.query.domain(port, is_input)?;
        self.domains.insert(key, domain.clone());
        Ok(domain)
    }

    fn mode_of(&mut self, port: &Q::Port, domain: &str, is_input: bool) -> Result<BufferMode, DomainResolutionError> {
        let key = (port.clone(), is_input, domain.to_string());
        if let Some(mode) = self.modes.get(&key) {
            return Ok(*mode);
        }
        let mode = self.query.buffer_mode(port, domain, is_input)?;
        self.modes.insert(key, mode);
        Ok(mode)
    }

    /// Can `main` share buffers with every port in `members`?
    fn acceptable(&mut self, main: &Q::Port, members: &[Q::Port], is_input: bool) -> Result<bool, DomainResolutionError> {
        if self.query.is_bridge(main) {
            return Ok(true);
        }
        let main_domain = self.domain_of(main, is_input)?;

        let mut all_abdicate = true;
        let mut member_domains: Vec<String> = Vec::new();
        for member in members {
            let domain = self.domain_of(member, !is_input)?;
            if !member_domains.contains(&domain) {
                member_domains.push(domain);
            }
            if self.mode_of(member, &main_domain, !is_input)? != BufferMode::Abdicate {
                all_abdicate = false;
            }
        }

        if member_domains.len() != 1 {
            return Ok(false);
        }
        let member_domain = member_domains.remove(0);

        match self.mode_of(main, &member_domain, is_input)? {
            BufferMode::Error => Ok(false),
            BufferMode::Abdicate => Ok(true),
            // A custom destination cannot pick between several upstream pools.
            BufferMode::Custom if is_input && members.len() > 1 => Ok(false),
            BufferMode::Custom => Ok(all_abdicate),
        }
    }

    /// Query every group and name the ports that need a bridge.
    pub fn judge(&mut self, flows: &[Flow<Q::Port>]) -> Result<Verdict<Q::Port>, DomainResolutionError> {
        let (sources, destinations) = groups(flows);
        let mut verdict = Verdict {
            bad_sources: HashSet::new(),
            bad_destinations: HashSet::new(),
        };
        for (main, members) in &sources {
            if !self.acceptable(main, members, false)? {
                tracing::debug!(port = ?main, "output crossing needs a bridge");
                verdict.bad_sources.insert(main.clone());
            }
        }
        for (main, members) in &destinations {
            if !self.acceptable(main, members, true)? {
                tracing::debug!(port = ?main, "input crossing needs a bridge");
                verdict.bad_destinations.insert(main.clone());
            }
        }
        Ok(verdict)
    }

    /// Judge then apply in one call.
    pub fn resolve<B>(
        &mut self,
        flows: &[Flow<Q::Port>],
        source: &mut B,
    ) -> Result<Resolution<Q::Port>, DomainResolutionError>
    where
        B: BridgeSource<Port = Q::Port>,
    {
        let verdict = self.judge(flows)?;
        verdict.apply(flows, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers come from tables; ports named `bridge*` are bridges.
    #[derive(Default)]
    struct Table {
        domains: HashMap<&'static str, &'static str>,
        modes: HashMap<(&'static str, &'static str), BufferMode>,
        domain_calls: usize,
        mode_calls: usize,
        fail_on: Option<&'static str>,
    }

    impl DomainQuery for Table {
        type Port = String;

        fn domain(&mut self, port: &String, _is_input: bool) -> Result<String, DomainResolutionError> {
            self.domain_calls += 1;
            if self.fail_on == Some(port.as_str()) {
                return Err(DomainResolutionError::Query {
                    port: port.clone(),
                    reason: "unreachable".into(),
                });
            }
            Ok(self.domains.get(port.as_str()).copied().unwrap_or("").to_string())
        }

        fn buffer_mode(&mut self, port: &String, domain: &str, _is_input: bool) -> Result<BufferMode, DomainResolutionError> {
            self.mode_calls += 1;
            Ok(self
                .modes
                .iter()
                .find(|((p, d), _)| *p == port.as_str() && *d == domain)
                .map(|(_, m)| *m)
                .unwrap_or(BufferMode::Abdicate))
        }

        fn is_bridge(&self, port: &String) -> bool {
            port.starts_with("bridge")
        }
    }

    #[derive(Default)]
    struct Bridges(usize);

    impl BridgeSource for Bridges {
        type Port = String;

        fn create_bridge(&mut self) -> Result<(String, String), DomainResolutionError> {
            self.0 += 1;
            Ok((format!("bridge{}.in", self.0), format!("bridge{}.out", self.0)))
        }
    }

    fn flow(src: &str, dst: &str) -> Flow<String> {
        Flow::new(src.to_string(), dst.to_string())
    }

    #[test]
    fn mode_strings_round_trip() {
        for mode in [BufferMode::Abdicate, BufferMode::Custom, BufferMode::Error] {
            assert_eq!(mode.as_str().parse::<BufferMode>().unwrap(), mode);
        }
        assert_eq!(
            "SOMETIMES".parse::<BufferMode>(),
            Err(DomainResolutionError::UnknownMode("SOMETIMES".into()))
        );
    }

    #[test]
    fn matching_abdicating_ports_pass_through() {
        let flows = vec![flow("a.out", "b.in")];
        let mut resolver = DomainFlowResolver::new(Table::default());
        let mut bridges = Bridges::default();
        let resolution = resolver.resolve(&flows, &mut bridges).unwrap();
        assert_eq!(resolution.flows, flows);
        assert_eq!(resolution.bridges, 0);
    }

    #[test]
    fn custom_source_with_mixed_destinations_gets_one_bridge() {
        let mut table = Table::default();
        table.domains.insert("src.out", "gpu");
        table.domains.insert("d1.in", "gpu");
        table.domains.insert("d2.in", "cpu");
        table.modes.insert(("src.out", "gpu"), BufferMode::Custom);
        table.modes.insert(("src.out", "cpu"), BufferMode::Custom);

        let flows = vec![flow("src.out", "d1.in"), flow("src.out", "d2.in")];
        let mut resolver = DomainFlowResolver::new(table);
        let mut bridges = Bridges::default();
        let resolution = resolver.resolve(&flows, &mut bridges).unwrap();

        assert_eq!(resolution.bridges, 1);
        assert_eq!(
            resolution.flows,
            vec![
                flow("src.out", "bridge1.in"),
                flow("bridge1.out", "d1.in"),
                flow("bridge1.out", "d2.in"),
            ]
        );
    }

    #[test]
    fn custom_input_with_fan_in_is_rejected() {
        let mut table = Table::default();
        table.modes.insert(("sink.in", ""), BufferMode::Custom);
        let flows = vec![flow("a.out", "sink.in"), flow("b.out", "sink.in")];
        let mut resolver = DomainFlowResolver::new(table);
        let verdict = resolver.judge(&flows).unwrap();
        assert_eq!(verdict.bad_destinations().collect::<Vec<_>>(), vec!["sink.in"]);
        assert_eq!(verdict.bad_sources().count(), 0);
    }

    #[test]
    fn custom_output_with_fan_out_is_accepted_when_all_abdicate() {
        let mut table = Table::default();
        table.modes.insert(("src.out", ""), BufferMode::Custom);
        let flows = vec![flow("src.out", "a.in"), flow("src.out", "b.in")];
        let mut resolver = DomainFlowResolver::new(table);
        assert!(resolver.judge(&flows).unwrap().is_clean());
    }

    #[test]
    fn custom_meets_custom_needs_bridge() {
        let mut table = Table::default();
        table.modes.insert(("src.out", ""), BufferMode::Custom);
        table.modes.insert(("dst.in", ""), BufferMode::Custom);
        let flows = vec![flow("src.out", "dst.in")];
        let mut resolver = DomainFlowResolver::new(table);
        let mut bridges = Bridges::default();
        let resolution = resolver.resolve(&flows, &mut bridges).unwrap();
        // both ends are unacceptable: chained bridges
        assert_eq!(resolution.bridges, 2);
        assert_eq!(
            resolution.flows,
            vec![
                flow("src.out", "bridge1.in"),
                flow("bridge1.out", "bridge2.in"),
                flow("bridge2.out", "dst.in"),
            ]
        );
    }

    #[test]
    fn error_mode_needs_bridge() {
        let mut table = Table::default();
        table.domains.insert("src.out", "fpga");
        table.modes.insert(("dst.in", "fpga"), BufferMode::Error);
        let flows = vec![flow("src.out", "dst.in")];
        let mut resolver = DomainFlowResolver::new(table);
        let verdict = resolver.judge(&flows).unwrap();
        assert_eq!(verdict.bad_destinations().count(), 1);
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut table = Table::default();
        table.domains.insert("src.out", "gpu");
        table.domains.insert("d1.in", "gpu");
        table.domains.insert("d2.in", "cpu");
        table.modes.insert(("src.out", "gpu"), BufferMode::Custom);
        let flows = vec![flow("src.out", "d1.in"), flow("src.out", "d2.in")];
        let mut resolver = DomainFlowResolver::new(table);
        let mut bridges = Bridges::default();
        let first = resolver.resolve(&flows, &mut bridges).unwrap();
        let second = resolver.resolve(&first.flows, &mut bridges).unwrap();
        assert_eq!(second.bridges, 0);
        assert_eq!(second.flows, first.flows);
    }

    #[test]
    fn queries_are_cached() {
        let flows = vec![flow("a.out", "b.in"), flow("a.out", "c.in"), flow("d.out", "b.in")];
        let mut resolver = DomainFlowResolver::new(Table::default());
        resolver.judge(&flows).unwrap();
        let table = resolver.query();
        // four distinct (port, direction) pairs
        assert_eq!(table.domain_calls, 4);
        let (domain_calls, mode_calls) = (table.domain_calls, table.mode_calls);
        resolver.judge(&flows).unwrap();
        assert_eq!(resolver.query().domain_calls, domain_calls);
        assert_eq!(resolver.query().mode_calls, mode_calls);
    }

    #[test]
    fn failed_query_creates_no_bridge() {
        let mut table = Table::default();
        table.modes.insert(("src.out", ""), BufferMode::Custom);
        table.modes.insert(("dst.in", ""), BufferMode::Custom);
        table.fail_on = Some("late.in");
        let flows = vec![flow("src.out", "dst.in"), flow("x.out", "late.in")];
        let mut resolver = DomainFlowResolver::new(table);
        let mut bridges = Bridges::default();
        let err = resolver.resolve(&flows, &mut bridges).unwrap_err();
        assert!(matches!(err, DomainResolutionError::Query { .. }));
        assert_eq!(bridges.0, 0);
    }
}
