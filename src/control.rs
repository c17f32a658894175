// Islet Control Tokens
//
// Non-local transfer is modeled as the error channel of every evaluation
// step: a token rides alongside the value channel until a matching
// installer absorbs it. Tokens are never user values.

use crate::env::{BlockId, TagbodyId};
use crate::symbol::SymbolId;
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Payload of return-from, absorbed by the block with the same id.
    Return { block: BlockId, value: NodeId },
    /// Payload of go, absorbed by the tagbody with the same id.
    Go { tagbody: TagbodyId, tag: SymbolId },
    /// Payload of throw; the catch tag is a value compared by eql.
    Throw { tag: NodeId, value: NodeId },
    /// A signaled condition (an instance of <serious-condition>).
    Condition { condition: NodeId },
    /// Resumption of a continuable signal: unwinds handler frames back to
    /// the signal-condition site at `depth` and supplies `value` there.
    ContinueSignal { depth: u32, value: NodeId },
}

/// Result of evaluation: exactly one of value or token.
pub type EvalResult = Result<NodeId, Control>;
