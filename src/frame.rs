//! The frame chain: the invariant that every active computation has a
//! singly-linked ancestry of activations, reachable from its owning
//! tasklet.
//!
//! Two frame shapes share this chain: interpreted frames (which support
//! trace-driven line jumps, §4.4.1) and C-frames (which embed a native
//! callable as a tasklet and never appear in a user-visible traceback).
//! Frame allocation is recycled through a per-code "zombie" cache plus a
//! bounded global free-list, following `spec.md` §4.4's allocation strategy.

use std::collections::HashMap;
use std::fmt;

use crate::value::Value;

/// Default capacity of the global frame free-list (`spec.md` §9's
/// suggested 200).
pub const DEFAULT_FREE_LIST_CAPACITY: usize = 200;

/// Opaque identity of a piece of code a frame executes, used to key the
/// per-code zombie cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CodeId(pub u64);

/// A native callable invoked by a [`CFrame`].
pub type NativeFn = Box<dyn FnMut(&mut CFrame) -> Value>;

/// The kinds of structured blocks a simulated block-stack walk needs to
/// reason about when validating a trace-driven line jump (§4.4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Try,
    For,
    While,
    With,
    /// The `finally` clause of a `try`/`finally`.
    Finally,
}

/// A single active (nested) structured block, recorded at frame-build time.
#[derive(Clone, Copy, Debug)]
pub struct Block {
    pub kind: BlockKind,
    /// Value-stack depth at which this block was entered; exiting the block
    /// truncates the value stack back to this depth.
    pub stack_level: usize,
    /// Source line range `[start, end)` this block's body spans.
    pub line_start: u32,
    pub line_end: u32,
    /// Whether this block starts by consuming an exception off the value
    /// stack (an `except`/`finally` handler entry line).
    pub consumes_exception: bool,
}

/// An interpreted activation: the bulk of `spec.md` §4.4's frame node shape,
/// minus the locals/value-stack storage mechanics explicitly out of scope.
pub struct Frame {
    pub code: CodeId,
    pub line: u32,
    /// Structured blocks active at the current line, outermost first.
    pub blocks: Vec<Block>,
    /// All blocks recorded for this code object at build time, used by
    /// `set_line`'s simulated walk; not just the currently-active ones.
    pub all_blocks: Vec<Block>,
    trace_hook_installed: bool,
}

impl Frame {
    #[must_use]
    pub fn new(code: CodeId) -> Self {
        Self {
            code,
            line: 0,
            blocks: Vec::new(),
            all_blocks: Vec::new(),
            trace_hook_installed: false,
        }
    }

    fn reset(&mut self, code: CodeId) {
        self.code = code;
        self.line = 0;
        self.blocks.clear();
        self.all_blocks.clear();
        self.trace_hook_installed = false;
    }
}

/// A native-callable activation. Exposes only the slots `spec.md` §4.4
/// names: three object slots, two integer slots, two opaque scratch slots.
/// Grounded in `Stackless/core/cframeobject.c`'s slot shapes (see
/// DESIGN.md): `callable`/`args`/`kwargs` as the three object slots,
/// `resume_state`/`depth` as the two integer slots, `scratch` as the two
/// opaque slots a callable's executor may repurpose across re-entries.
pub struct CFrame {
    pub args: Value,
    pub kwargs: Option<Value>,
    pub resume_state: i32,
    pub depth: i32,
    pub scratch: [Value; 2],
}

/// One node of the frame ancestry: either an interpreted frame or a
/// C-frame, plus the `back` link to the caller.
pub enum FrameNode {
    Interpreted(Frame),
    Native { frame: CFrame, executor: NativeFn },
}

impl fmt::Debug for FrameNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameNode::Interpreted(frame) => f
                .debug_struct("Interpreted")
                .field("code", &frame.code)
                .field("line", &frame.line)
                .finish(),
            FrameNode::Native { .. } => f.debug_struct("Native").finish_non_exhaustive(),
        }
    }
}

/// The ancestry of activations backing one tasklet: `frame` is the
/// innermost node, `back` links reach a root whose `back == None`.
pub struct FrameChain {
    nodes: Vec<FrameNode>,
}

impl FrameChain {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    pub fn push_interpreted(&mut self, frame: Frame) {
        self.nodes.push(FrameNode::Interpreted(frame));
    }

    pub fn push_native(&mut self, frame: CFrame, executor: NativeFn) {
        self.nodes.push(FrameNode::Native { frame, executor });
    }

    pub fn pop(&mut self) -> Option<FrameNode> {
        self.nodes.pop()
    }

    #[must_use]
    pub fn innermost(&self) -> Option<&FrameNode> {
        self.nodes.last()
    }

    pub fn innermost_mut(&mut self) -> Option<&mut FrameNode> {
        self.nodes.last_mut()
    }

    /// Attempts to set the innermost interpreted frame's line, validating
    /// the §4.4.1 jump legality rules. `is_initial_call` marks the first
    /// trace event of this frame's execution, from which jumping is never
    /// legal.
    pub fn set_line(&mut self, new_line: u32, event: TraceEvent, is_initial_call: bool) -> Result<(), JumpError> {
        let Some(FrameNode::Interpreted(frame)) = self.nodes.last_mut() else {
            return Err(JumpError::NotInterpreted);
        };

        if event != TraceEvent::Line {
            return Err(JumpError::NotFromLineEvent);
        }
        if is_initial_call {
            return Err(JumpError::FromInitialCall);
        }

        let old_line = frame.line;
        let from_block = innermost_block_at(&frame.all_blocks, old_line);
        let to_block = innermost_block_at(&frame.all_blocks, new_line);

        if let Some(b) = to_block {
            if b.consumes_exception {
                return Err(JumpError::OntoExceptionConsumingLine);
            }
        }

        match (from_block.map(|b| b.kind), to_block.map(|b| b.kind)) {
            (Some(BlockKind::Finally), Some(BlockKind::Finally)) => {
                // Same finally: permitted, falls through to the generic
                // crossing check below using the shared block's own depth.
            }
            (Some(BlockKind::Finally), _) | (_, Some(BlockKind::Finally)) => {
                return Err(JumpError::AcrossFinallyBoundary);
            }
            _ => {}
        }

        // Crossing into or out of a block's interior (as opposed to staying
        // within the same innermost block, or moving between sibling lines
        // outside any block) is illegal unless both endpoints share the
        // same innermost block.
        let same_block = match (from_block, to_block) {
            (Some(a), Some(b)) => std::ptr::eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same_block {
            let entering_block = to_block.is_some_and(|b| new_line == b.line_start);
            let only_exiting = from_block.is_some() && to_block.is_none();
            if !entering_block && !only_exiting {
                return Err(JumpError::AcrossBlockSetupBoundary);
            }
        }

        // Truncate the (conceptual) value stack to each exited block's
        // recorded level; `with` blocks additionally drop their exit
        // function (modeled here by simply dropping the block record,
        // since this crate does not model an actual value stack).
        frame.blocks.retain(|b| b.stack_level <= to_block.map_or(0, |t| t.stack_level));

        frame.line = new_line;
        Ok(())
    }
}

impl Default for FrameChain {
    fn default() -> Self {
        Self::new()
    }
}

fn innermost_block_at(blocks: &[Block], line: u32) -> Option<&Block> {
    blocks
        .iter()
        .filter(|b| b.line_start <= line && line < b.line_end)
        .min_by_key(|b| b.line_end - b.line_start)
}

/// The trace event a line-jump request originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Call,
    Line,
    Return,
    Exception,
}

/// Why a requested line jump was rejected, per §4.4.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpError {
    NotInterpreted,
    NotFromLineEvent,
    FromInitialCall,
    AcrossFinallyBoundary,
    AcrossBlockSetupBoundary,
    OntoExceptionConsumingLine,
}

impl fmt::Display for JumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            JumpError::NotInterpreted => "cannot set the line of a native frame",
            JumpError::NotFromLineEvent => "line jumps are only legal from a 'line' trace event",
            JumpError::FromInitialCall => "cannot jump from a frame's initial 'call' event",
            JumpError::AcrossFinallyBoundary => "cannot jump into or out of a different finally block",
            JumpError::AcrossBlockSetupBoundary => "jump crosses a block's setup/teardown boundary",
            JumpError::OntoExceptionConsumingLine => "cannot jump onto a line that consumes an exception",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for JumpError {}

/// Recycles interpreted frames: one "zombie" slot per code identity plus a
/// bounded overflow free-list, so repeated call bursts of the same code (or
/// a mix of codes, up to the configured capacity) avoid allocator churn.
pub struct FrameFreeList {
    zombies: HashMap<CodeId, Frame>,
    overflow: Vec<Frame>,
    capacity: usize,
}

impl FrameFreeList {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            zombies: HashMap::new(),
            overflow: Vec::new(),
            capacity,
        }
    }

    /// Obtains a frame for `code`, reusing its zombie or an overflow slot
    /// if available, allocating fresh otherwise.
    pub fn acquire(&mut self, code: CodeId) -> Frame {
        if let Some(mut frame) = self.zombies.remove(&code) {
            frame.reset(code);
            return frame;
        }
        if let Some(mut frame) = self.overflow.pop() {
            frame.reset(code);
            return frame;
        }
        Frame::new(code)
    }

    /// Returns a frame to the free-list: first as this code's zombie slot,
    /// else into the bounded overflow list, else it is dropped.
    pub fn release(&mut self, frame: Frame) {
        let code = frame.code;
        if !self.zombies.contains_key(&code) {
            self.zombies.insert(code, frame);
            return;
        }
        if self.overflow.len() < self.capacity {
            self.overflow.push(frame);
        }
        // Otherwise drop it: the free-list is at capacity.
    }
}

impl Default for FrameFreeList {
    fn default() -> Self {
        Self::new(DEFAULT_FREE_LIST_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(kind: BlockKind, start: u32, end: u32, level: usize, consumes: bool) -> Block {
        Block {
            kind,
            stack_level: level,
            line_start: start,
            line_end: end,
            consumes_exception: consumes,
        }
    }

    fn chain_with_blocks(blocks: Vec<Block>, line: u32) -> FrameChain {
        let mut chain = FrameChain::new();
        let mut frame = Frame::new(CodeId(1));
        frame.line = line;
        frame.all_blocks = blocks.clone();
        frame.blocks = blocks;
        chain.push_interpreted(frame);
        chain
    }

    #[test]
    fn jump_within_same_block_succeeds() {
        let mut chain = chain_with_blocks(vec![block(BlockKind::While, 10, 20, 0, false)], 12);
        assert!(chain.set_line(15, TraceEvent::Line, false).is_ok());
    }

    #[test]
    fn jump_from_initial_call_fails() {
        let mut chain = chain_with_blocks(vec![], 1);
        assert_eq!(
            chain.set_line(2, TraceEvent::Line, true),
            Err(JumpError::FromInitialCall)
        );
    }

    #[test]
    fn jump_into_finally_fails() {
        let mut chain = chain_with_blocks(
            vec![
                block(BlockKind::Try, 1, 30, 0, false),
                block(BlockKind::Finally, 20, 30, 0, false),
            ],
            5,
        );
        assert_eq!(
            chain.set_line(22, TraceEvent::Line, false),
            Err(JumpError::AcrossFinallyBoundary)
        );
    }

    #[test]
    fn jump_onto_exception_consuming_line_fails() {
        let mut chain = chain_with_blocks(vec![block(BlockKind::Try, 1, 30, 0, true)], 5);
        assert_eq!(
            chain.set_line(2, TraceEvent::Line, false),
            Err(JumpError::OntoExceptionConsumingLine)
        );
    }

    #[test]
    fn free_list_recycles_zombie_per_code() {
        let mut free_list = FrameFreeList::new(2);
        let frame = free_list.acquire(CodeId(1));
        free_list.release(frame);
        let frame2 = free_list.acquire(CodeId(1));
        assert_eq!(frame2.code, CodeId(1));
    }
}
