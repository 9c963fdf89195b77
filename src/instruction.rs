//! Instruction graph and listing parser
//!
//! A binary's pre-disassembled instruction listing is parsed into an indexed
//! directed graph whose edges follow def→use flow between instructions. The
//! graph answers what data type the load or store at a given cubin-relative
//! PC produces or consumes, walking the dataflow when the instruction itself
//! carries no type annotation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AnalyzerError, Result};

/// Data type classification of a memory access
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DataType {
    /// No type information available
    #[default]
    Unknown,
    /// Integer of any signedness
    Integer,
    /// IEEE-754 floating point
    Float,
}

/// How a thread accesses memory: data type, vector width, and unit width,
/// all in bits
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AccessKind {
    /// Total access width: 8, 16, 32, 64, or 128
    pub vec_size: u32,
    /// Element width: 8, 16, 32, or 64
    pub unit_size: u32,
    /// Element classification
    pub data_type: DataType,
}

impl AccessKind {
    /// Create an access kind from its three fields
    pub fn new(data_type: DataType, vec_size: u32, unit_size: u32) -> Self {
        Self {
            vec_size,
            unit_size,
            data_type,
        }
    }

    /// Whether no concrete type information is attached
    pub fn is_unknown(&self) -> bool {
        self.data_type == DataType::Unknown
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.data_type {
            DataType::Unknown => "UNKNOWN",
            DataType::Integer => "INTEGER",
            DataType::Float => "FLOAT",
        };
        write!(f, "{{{}, v: {}, u: {}}}", name, self.vec_size, self.unit_size)
    }
}

/// A function symbol of a binary.
///
/// `pc` is the runtime address assigned at registration; within one binary no
/// two symbols share it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Symbol {
    /// Index of the owning function in the binary's function table
    pub function_index: u32,
    /// Offset of the function inside the cubin image
    pub cubin_offset: u64,
    /// Runtime address of the function entry
    pub pc: u64,
}

impl Symbol {
    /// Create a symbol from its three fields
    pub fn new(function_index: u32, cubin_offset: u64, pc: u64) -> Self {
        Self {
            function_index,
            cubin_offset,
            pc,
        }
    }
}

/// A single instruction of the listing
#[derive(Debug, Clone, Default)]
pub struct Instruction {
    /// Cubin-relative program counter
    pub pc: u32,
    /// Opcode mnemonic, e.g. `LDG.E.F32`
    pub op: String,
    /// Guard predicate register, -1 when unpredicated
    pub predicate: i32,
    /// Destination registers
    pub dsts: Vec<i32>,
    /// Source registers
    pub srcs: Vec<i32>,
    /// Reaching definitions: register → pcs of its defining instructions
    pub assign_pcs: BTreeMap<i32, Vec<u32>>,
    /// Access kind derived from the mnemonic, if annotated
    pub access_kind: Option<AccessKind>,
}

/// Directed def→use graph over the instructions of one binary.
///
/// Built once at parse time and read-only afterwards; every edge endpoint is
/// guaranteed to exist as a node.
#[derive(Debug, Clone, Default)]
pub struct InstructionGraph {
    nodes: BTreeMap<u32, Instruction>,
    incoming: HashMap<u32, BTreeSet<u32>>,
    outgoing: HashMap<u32, BTreeSet<u32>>,
}

impl InstructionGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instruction nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no instructions
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The instruction at `pc`, if present
    pub fn node(&self, pc: u32) -> Option<&Instruction> {
        self.nodes.get(&pc)
    }

    /// Whether an instruction exists at `pc`
    pub fn has_node(&self, pc: u32) -> bool {
        self.nodes.contains_key(&pc)
    }

    /// Successors of `pc` (instructions using its definitions)
    pub fn outgoing_nodes(&self, pc: u32) -> Option<&BTreeSet<u32>> {
        self.outgoing.get(&pc)
    }

    /// Predecessors of `pc` (instructions defining its sources)
    pub fn incoming_nodes(&self, pc: u32) -> Option<&BTreeSet<u32>> {
        self.incoming.get(&pc)
    }

    fn add_node(&mut self, inst: Instruction) {
        self.nodes.insert(inst.pc, inst);
    }

    fn add_edge(&mut self, from: u32, to: u32) {
        self.incoming.entry(to).or_default().insert(from);
        self.outgoing.entry(from).or_default().insert(to);
    }
}

/// Infer the access kind produced by the load at `pc` by walking the uses of
/// its destination register breadth-first. The first concretely annotated
/// instruction in BFS order wins; an exhausted walk yields `Unknown`.
pub fn load_data_type(pc: u32, graph: &InstructionGraph) -> AccessKind {
    data_type_walk(pc, graph, |g, p| g.outgoing_nodes(p))
}

/// Infer the access kind consumed by the store at `pc` by walking the
/// definitions of its source register breadth-first.
pub fn store_data_type(pc: u32, graph: &InstructionGraph) -> AccessKind {
    data_type_walk(pc, graph, |g, p| g.incoming_nodes(p))
}

fn data_type_walk<'a, F>(pc: u32, graph: &'a InstructionGraph, neighbors: F) -> AccessKind
where
    F: Fn(&'a InstructionGraph, u32) -> Option<&'a BTreeSet<u32>>,
{
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    visited.insert(pc);

    if let Some(next) = neighbors(graph, pc) {
        for &n in next {
            if visited.insert(n) {
                queue.push_back(n);
            }
        }
    }

    while let Some(current) = queue.pop_front() {
        if let Some(inst) = graph.node(current) {
            if let Some(kind) = inst.access_kind {
                if !kind.is_unknown() {
                    return kind;
                }
            }
        }
        if let Some(next) = neighbors(graph, current) {
            for &n in next {
                if visited.insert(n) {
                    queue.push_back(n);
                }
            }
        }
    }

    AccessKind::default()
}

/// Derive an access kind from `.`-separated op tokens.
///
/// `F16|F32|F64` mark a float unit, `S8|U8|...|S64|U64` an integer unit; a
/// `V2|V4` token widens the vector by that factor, and a standalone width
/// token at least as wide as the unit sets the vector size directly. Ops
/// with no type token yield `None`.
fn access_kind_from_op(op: &str) -> Option<AccessKind> {
    let mut data_type = DataType::Unknown;
    let mut unit_size = 0u32;
    let mut lanes = 1u32;
    let mut vec_size = 0u32;

    for token in op.split('.').skip(1) {
        match token {
            "F16" => (data_type, unit_size) = (DataType::Float, 16),
            "F32" => (data_type, unit_size) = (DataType::Float, 32),
            "F64" => (data_type, unit_size) = (DataType::Float, 64),
            "S8" | "U8" => (data_type, unit_size) = (DataType::Integer, 8),
            "S16" | "U16" => (data_type, unit_size) = (DataType::Integer, 16),
            "S32" | "U32" => (data_type, unit_size) = (DataType::Integer, 32),
            "S64" | "U64" => (data_type, unit_size) = (DataType::Integer, 64),
            "V2" => lanes = 2,
            "V4" => lanes = 4,
            _ => {
                if let Ok(width) = token.parse::<u32>() {
                    vec_size = width;
                }
            }
        }
    }

    if data_type == DataType::Unknown {
        return None;
    }
    if vec_size < unit_size {
        vec_size = unit_size * lanes;
    }
    Some(AccessKind::new(data_type, vec_size, unit_size))
}

/// Parse an instruction listing into its symbol template and graph.
///
/// Line format (`#` lines and blank lines are skipped):
///
/// ```text
/// sym <function_index> <cubin_offset>
/// inst <pc> <op> [pred=<p>] [dst=R<i>,...] [src=R<i>,...] [assign=R<i>:<pc>|<pc>;...]
/// ```
///
/// Numbers accept decimal or `0x` hex. Edges follow the reaching
/// definitions: for register `r` used at `t`, every defining pc `s` in
/// `assign` contributes `s → t`. Edges naming a pc with no instruction are
/// dropped so the graph invariant holds.
pub fn parse_instruction_listing(text: &str) -> Result<(Vec<Symbol>, InstructionGraph)> {
    let mut symbols = Vec::new();
    let mut graph = InstructionGraph::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("sym") => {
                let function_index = parse_num(tokens.next(), lineno)? as u32;
                let cubin_offset = parse_num(tokens.next(), lineno)?;
                symbols.push(Symbol::new(function_index, cubin_offset, 0));
            }
            Some("inst") => {
                let pc = parse_num(tokens.next(), lineno)? as u32;
                let op = tokens
                    .next()
                    .ok_or_else(|| listing_error(lineno, "missing op"))?
                    .to_string();

                let mut inst = Instruction {
                    pc,
                    predicate: -1,
                    access_kind: access_kind_from_op(&op),
                    op,
                    ..Default::default()
                };

                for field in tokens {
                    let (key, value) = field
                        .split_once('=')
                        .ok_or_else(|| listing_error(lineno, "malformed field"))?;
                    match key {
                        "pred" => {
                            inst.predicate = value
                                .parse()
                                .map_err(|_| listing_error(lineno, "bad predicate"))?;
                        }
                        "dst" => inst.dsts = parse_registers(value, lineno)?,
                        "src" => inst.srcs = parse_registers(value, lineno)?,
                        "assign" => inst.assign_pcs = parse_assigns(value, lineno)?,
                        _ => return Err(listing_error(lineno, "unknown field")),
                    }
                }

                if graph.has_node(pc) {
                    return Err(listing_error(lineno, "duplicate instruction pc"));
                }
                graph.add_node(inst);
            }
            _ => return Err(listing_error(lineno, "unknown directive")),
        }
    }

    // Edges are resolved once all nodes exist
    let uses: Vec<(u32, Vec<u32>)> = graph
        .nodes
        .values()
        .map(|inst| {
            let defs = inst.assign_pcs.values().flatten().copied().collect();
            (inst.pc, defs)
        })
        .collect();
    for (to, defs) in uses {
        for from in defs {
            if graph.has_node(from) {
                graph.add_edge(from, to);
            }
        }
    }

    Ok((symbols, graph))
}

fn listing_error(lineno: usize, message: &str) -> AnalyzerError {
    AnalyzerError::FailedAnalyzeBinary(format!("line {}: {}", lineno + 1, message))
}

fn parse_num(token: Option<&str>, lineno: usize) -> Result<u64> {
    let token = token.ok_or_else(|| listing_error(lineno, "missing number"))?;
    let parsed = if let Some(hex) = token.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        token.parse()
    };
    parsed.map_err(|_| listing_error(lineno, "bad number"))
}

fn parse_register(token: &str, lineno: usize) -> Result<i32> {
    token
        .strip_prefix('R')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| listing_error(lineno, "bad register"))
}

fn parse_registers(value: &str, lineno: usize) -> Result<Vec<i32>> {
    value
        .split(',')
        .filter(|t| !t.is_empty())
        .map(|t| parse_register(t, lineno))
        .collect()
}

fn parse_assigns(value: &str, lineno: usize) -> Result<BTreeMap<i32, Vec<u32>>> {
    let mut assigns = BTreeMap::new();
    for group in value.split(';').filter(|g| !g.is_empty()) {
        let (reg, pcs) = group
            .split_once(':')
            .ok_or_else(|| listing_error(lineno, "malformed assign"))?;
        let reg = parse_register(reg, lineno)?;
        let pcs = pcs
            .split('|')
            .filter(|p| !p.is_empty())
            .map(|p| parse_num(Some(p), lineno).map(|n| n as u32))
            .collect::<Result<Vec<u32>>>()?;
        assigns.insert(reg, pcs);
    }
    Ok(assigns)
}
