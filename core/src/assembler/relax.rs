//! Branch-width relaxation.
//!
//! Every branch is emitted with no displacement bytes at all; a
//! [`JumpLink`] remembers where the displacement will go (`source`) and
//! where it must land (`target`). This pass assigns each link the
//! smallest width in {1, 2, 4} bytes whose signed range still reaches the
//! target, accounting for the fact that widening one branch pushes every
//! later byte further away and can force another branch to widen too.
//!
//! The loop runs to a fixed point. Widths only ever grow, so it
//! terminates; the iteration bound exists as a backstop and tripping it
//! is reported as an error rather than silently emitting bad offsets.

use crate::Vec;
use tracing::debug;

use super::error::AssembleError;

/// A pending branch displacement.
///
/// `source` is the byte-list index of the first displacement byte, i.e.
/// the position immediately after the branch opcode. `target` is the
/// byte-list index of the labeled instruction. During relaxation both are
/// adjusted to final byte offsets as earlier links grow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLink {
    pub(crate) source: isize,
    pub(crate) target: isize,
    /// Displacement bytes currently materialized: 0 before relaxation,
    /// then grows monotonically to 1, 2 or 4.
    pub(crate) size: u8,
    /// Absolute 32-bit encoding (closure function addresses). Inhibits
    /// PC-relative encoding and never shrinks below 4 bytes.
    pub(crate) absolute: bool,
    /// Branch direction in the original byte stream.
    pub(crate) forward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointerKind {
    Address,
    Target,
}

/// Sort handle over one end of a [`JumpLink`].
#[derive(Debug, Clone, Copy)]
struct JumpLinkPointer {
    index: usize,
    kind: PointerKind,
}

/// Sort key for relaxation sweeps.
///
/// If we have `(label l1) (goto l2) (nop) (goto l1) (label l2)` then the
/// source address assigned to `(goto l1)` equals the target address
/// assigned to `(label l2)`. The extra bit forces the target to sort
/// after the source so that a jump whose source collides with a label
/// still counts as crossing it.
fn sort_key(links: &[JumpLink], pointer: &JumpLinkPointer) -> isize {
    match pointer.kind {
        PointerKind::Target => 2 * links[pointer.index].target + 1,
        PointerKind::Address => 2 * links[pointer.index].source,
    }
}

const MAX_ITERATIONS: usize = 10;

/// Grow every link to its final width, adjusting sources and targets to
/// final byte offsets. When `force_wide` is set (jump optimization
/// disabled) every link is widened straight to 4 bytes.
pub(crate) fn relax(links: &mut [JumpLink], force_wide: bool) -> Result<(), AssembleError> {
    if links.is_empty() {
        return Ok(());
    }

    // Two pointers per link, sorted once by the pre-relaxation offsets.
    let mut pointers = Vec::with_capacity(2 * links.len());
    for index in 0..links.len() {
        pointers.push(JumpLinkPointer {
            index,
            kind: PointerKind::Address,
        });
    }
    for index in 0..links.len() {
        pointers.push(JumpLinkPointer {
            index,
            kind: PointerKind::Target,
        });
    }
    pointers.sort_unstable_by_key(|pointer| sort_key(links, pointer));

    let mut iteration = 0;
    loop {
        let mut offset: isize = 0;
        iteration += 1;
        for pointer in &pointers {
            let link = &mut links[pointer.index];
            match pointer.kind {
                PointerKind::Target => {
                    link.target += offset;
                }
                PointerKind::Address => {
                    link.source += offset;

                    let difference = link.target - (link.source + link.size as isize);
                    let mut new_size: u8 = if force_wide {
                        4
                    } else if (i8::MIN as isize..=i8::MAX as isize).contains(&difference) {
                        1
                    } else if (i16::MIN as isize..=i16::MAX as isize).contains(&difference) {
                        2
                    } else {
                        4
                    };
                    if link.absolute {
                        new_size = 4;
                    }

                    if new_size != link.size {
                        offset += new_size as isize - link.size as isize;
                        link.size = new_size;
                    }
                }
            }
        }
        debug!(iteration, offset, "relaxation sweep");
        if offset == 0 {
            return Ok(());
        }
        if iteration >= MAX_ITERATIONS {
            return Err(AssembleError::RelaxationDiverged {
                iterations: iteration,
            });
        }
    }
}
