//! Functions, basic blocks, and attribute sets.
//!
//! A [`Function`] owns two arenas (blocks and instructions) plus a block
//! layout list whose first entry is the distinguished entry block. Blocks
//! hold ordered lists of [`InstId`]s; erasing an instruction detaches it from
//! its block but keeps the arena slot, so ids handed out earlier stay valid.

use crate::instruction::{InstKind, Instruction, Value};
use crate::module::Linkage;
use crate::types::{BlockId, InstId, Type};

/// Function-level attributes understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Never inline this function back into callers.
    NoInline,
    /// Exclude from optimization entirely.
    OptimizeNone,
    /// Exclude from code-rewriting transformations. Set on functions whose
    /// code bytes must stay stable after they have been measured.
    NoObfuscate,
}

impl Attribute {
    fn bit(self) -> u8 {
        match self {
            Attribute::NoInline => 1 << 0,
            Attribute::OptimizeNone => 1 << 1,
            Attribute::NoObfuscate => 1 << 2,
        }
    }
}

/// A small set of [`Attribute`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrSet(u8);

impl AttrSet {
    pub fn new() -> AttrSet {
        AttrSet(0)
    }

    pub fn add(&mut self, attr: Attribute) {
        self.0 |= attr.bit();
    }

    pub fn has(self, attr: Attribute) -> bool {
        self.0 & attr.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// An ordered sequence of instructions ending in exactly one terminator.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub name: String,
    insts: Vec<InstId>,
}

impl BasicBlock {
    fn new(name: String) -> BasicBlock {
        BasicBlock {
            name,
            insts: Vec::new(),
        }
    }

    pub fn insts(&self) -> &[InstId] {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

/// A named function: signature, linkage, attributes, and (for definitions)
/// the block arenas.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    ty: Type,
    linkage: Linkage,
    pub attrs: AttrSet,
    intrinsic: bool,
    insts: Vec<Instruction>,
    blocks: Vec<BasicBlock>,
    layout: Vec<BlockId>,
}

impl Function {
    /// Create a bodyless function. Adding a block turns it into a definition.
    pub fn new(name: impl Into<String>, ty: Type, linkage: Linkage) -> Function {
        Function {
            name: name.into(),
            ty,
            linkage,
            attrs: AttrSet::new(),
            intrinsic: false,
            insts: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
        }
    }

    pub(crate) fn new_intrinsic(name: impl Into<String>, ty: Type) -> Function {
        let mut f = Function::new(name, ty, Linkage::External);
        f.intrinsic = true;
        f
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn is_intrinsic(&self) -> bool {
        self.intrinsic
    }

    /// A function with no body is a declaration.
    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn return_ty(&self) -> &Type {
        match &self.ty {
            Type::Func { ret, .. } => ret,
            _ => &Type::Void,
        }
    }

    pub fn param_tys(&self) -> &[Type] {
        match &self.ty {
            Type::Func { params, .. } => params,
            _ => &[],
        }
    }

    // ---- blocks ----

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    /// Snapshot of the block layout, for iteration while mutating.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.layout.clone()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// Append a new empty block to the layout.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(name.into()));
        self.layout.push(id);
        id
    }

    fn add_block_after(&mut self, after: BlockId, name: String) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(name));
        let pos = self
            .layout
            .iter()
            .position(|&b| b == after)
            .map(|p| p + 1)
            .unwrap_or(self.layout.len());
        self.layout.insert(pos, id);
        id
    }

    // ---- instructions ----

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.index()]
    }

    /// Allocate an instruction in the arena without attaching it to a block.
    pub fn new_inst(&mut self, inst: Instruction) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        id
    }

    pub fn insert_inst(&mut self, bb: BlockId, index: usize, inst: InstId) {
        self.blocks[bb.index()].insts.insert(index, inst);
    }

    pub fn push_inst(&mut self, bb: BlockId, inst: InstId) {
        self.blocks[bb.index()].insts.push(inst);
    }

    /// Detach an instruction from a block. The caller is responsible for
    /// ensuring no attached instruction still uses its result.
    pub fn erase_from_block(&mut self, bb: BlockId, inst: InstId) {
        self.blocks[bb.index()].insts.retain(|&i| i != inst);
    }

    /// Locate an attached instruction: (block, position).
    pub fn find_inst(&self, inst: InstId) -> Option<(BlockId, usize)> {
        for &bb in &self.layout {
            if let Some(pos) = self.blocks[bb.index()].insts.iter().position(|&i| i == inst) {
                return Some((bb, pos));
            }
        }
        None
    }

    /// The block's terminator, when its last instruction is one.
    pub fn terminator(&self, bb: BlockId) -> Option<InstId> {
        let last = *self.blocks[bb.index()].insts.last()?;
        self.insts[last.index()].kind.is_terminator().then_some(last)
    }

    /// Index of the first non-phi instruction.
    pub fn first_insertion_point(&self, bb: BlockId) -> usize {
        let block = &self.blocks[bb.index()];
        block
            .insts
            .iter()
            .position(|&i| !self.insts[i.index()].kind.is_phi())
            .unwrap_or(block.insts.len())
    }

    /// Index past the leading phi and alloca run. Code inserted into a
    /// function prologue goes here so stack allocations stay at the top of
    /// the entry block.
    pub fn prologue_insertion_point(&self, bb: BlockId) -> usize {
        let block = &self.blocks[bb.index()];
        block
            .insts
            .iter()
            .position(|&i| {
                let kind = &self.insts[i.index()].kind;
                !kind.is_phi() && !kind.is_alloca()
            })
            .unwrap_or(block.insts.len())
    }

    // ---- CFG ----

    pub fn successors(&self, bb: BlockId) -> Vec<BlockId> {
        match self.terminator(bb) {
            Some(term) => self.insts[term.index()].kind.successors(),
            None => Vec::new(),
        }
    }

    /// Predecessors of `bb`, deduplicated, in layout order.
    pub fn preds(&self, bb: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for &p in &self.layout {
            if self.successors(p).contains(&bb) && !out.contains(&p) {
                out.push(p);
            }
        }
        out
    }

    /// Split `bb` before the instruction at `at`. Instructions from `at`
    /// onward (including the terminator) move to a new block named `name`,
    /// `bb` is terminated with an unconditional branch to it, and phi nodes
    /// in the moved terminator's successors are retargeted.
    pub fn split_block(&mut self, bb: BlockId, at: usize, name: impl Into<String>) -> BlockId {
        let new_bb = self.add_block_after(bb, name.into());
        let moved: Vec<InstId> = self.blocks[bb.index()].insts.split_off(at);
        self.blocks[new_bb.index()].insts = moved;

        let br = self.new_inst(Instruction::new(
            InstKind::Br { dest: new_bb },
            Type::Void,
            "",
        ));
        self.push_inst(bb, br);

        // The tail kept its old terminator; successors that tracked `bb` as a
        // predecessor now see `new_bb`.
        for succ in self.successors(new_bb) {
            if succ != new_bb {
                self.replace_phi_incoming_block(succ, bb, new_bb);
            }
        }
        new_bb
    }

    /// Rewrite phi incoming-block entries in `bb` from `from` to `to`.
    pub fn replace_phi_incoming_block(&mut self, bb: BlockId, from: BlockId, to: BlockId) {
        let insts = self.blocks[bb.index()].insts.clone();
        for id in insts {
            if let InstKind::Phi { incoming } = &mut self.insts[id.index()].kind {
                for (_, pred) in incoming.iter_mut() {
                    if *pred == from {
                        *pred = to;
                    }
                }
            }
        }
    }

    pub fn add_phi_incoming(&mut self, phi: InstId, value: Value, block: BlockId) {
        if let InstKind::Phi { incoming } = &mut self.insts[phi.index()].kind {
            incoming.push((value, block));
        }
    }

    // ---- uses ----

    /// Replace every attached operand equal to `from` with `to`. Returns the
    /// number of replacements.
    pub fn replace_all_uses(&mut self, from: &Value, to: &Value) -> usize {
        let mut replaced = 0;
        let layout = self.layout.clone();
        for bb in layout {
            let insts = self.blocks[bb.index()].insts.clone();
            for id in insts {
                for v in self.insts[id.index()].kind.values_mut() {
                    if v == from {
                        *v = to.clone();
                        replaced += 1;
                    }
                }
            }
        }
        replaced
    }

    /// Does any attached instruction use `value` as an operand?
    pub fn has_uses(&self, value: &Value) -> bool {
        self.layout.iter().any(|&bb| {
            self.blocks[bb.index()]
                .insts
                .iter()
                .any(|&id| self.insts[id.index()].kind.values().into_iter().any(|v| v == value))
        })
    }

    /// Result type of an operand, where it can be known from this function.
    pub fn value_type(&self, value: &Value) -> Option<Type> {
        match value {
            Value::Inst(id) => Some(self.insts[id.index()].ty.clone()),
            Value::Arg(i) => self.param_tys().get(*i).cloned(),
            Value::Const(c) => Some(c.ty()),
            Value::Global(_) | Value::Func(_) | Value::BlockAddress(_) => Some(Type::Ptr),
        }
    }

    /// Total number of attached instructions.
    pub fn inst_count(&self) -> usize {
        self.layout
            .iter()
            .map(|&bb| self.blocks[bb.index()].insts.len())
            .sum()
    }
}
