//! Structured control flow for compiled programs
//!
//! Forward branches are emitted with a zero destination and recorded on a frame stack. Once the
//! destination is known the placeholder is patched in place inside the [`ProgramBuffer`]. All
//! destinations are byte offsets into the stored file, header included.

use crate::encoding::{Instruction, INSTRUCTION_SIZE};
use crate::error::{Error, Result};
use crate::opcode;
use crate::output_buffer::ProgramBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    If,
    ElseIf,
    While,
    DoLoopBody,
}

/// An open control structure
///
/// For `If`/`ElseIf` the offset is the pending placeholder branch, for `While` the loop top
/// (the test instruction) and for `DoLoopBody` the first instruction of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub offset: usize,
    pub kind: FrameKind,
    /// Set once the final fallback branch of an `If`/`ElseIf` chain is open
    pub has_else: bool,
}

/// IO test evaluated by the target: `(inputs & mask) == value`, or `!=` when `equal` is false
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCondition {
    pub value: u16,
    pub mask: u16,
    pub equal: bool,
}

impl IoCondition {
    pub fn equal(value: u16, mask: u16) -> Self {
        IoCondition {
            value,
            mask,
            equal: true,
        }
    }

    pub fn not_equal(value: u16, mask: u16) -> Self {
        IoCondition {
            value,
            mask,
            equal: false,
        }
    }
}

/// Target masks stamped on emitted control instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTargets {
    /// Mask for branch and loop instructions
    pub flow: u8,
    /// Mask for the IO test preceding a conditional branch
    pub test: u8,
}

#[derive(Debug, Default)]
pub struct Assembler {
    frames: Vec<ControlFrame>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.frames.clear();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[ControlFrame] {
        &self.frames
    }

    fn top(&self, accepted: &[FrameKind], what: &str) -> Result<usize> {
        match self.frames.last() {
            Some(f) if accepted.contains(&f.kind) => Ok(self.frames.len() - 1),
            Some(f) => Err(Error::data(format!("{what} inside open {:?}", f.kind))),
            None => Err(Error::data(format!("{what} without matching begin"))),
        }
    }

    fn emit_test(prog: &mut ProgramBuffer, cond: IoCondition, targets: FlowTargets) {
        prog.push(&Instruction::new(
            opcode::TESTIO,
            targets.test,
            (cond.value as i16, cond.mask as i16, cond.equal as i8, 0i8),
        ));
    }

    fn emit_branch(prog: &mut ProgramBuffer, address: i32, targets: FlowTargets) -> usize {
        let at = prog.offset();
        prog.push(&Instruction::new(opcode::BRANCH, targets.flow, address));
        at
    }

    fn open_conditional(
        &mut self,
        prog: &mut ProgramBuffer,
        cond: IoCondition,
        targets: FlowTargets,
        kind: FrameKind,
    ) {
        Self::emit_test(prog, cond, targets);
        let offset = Self::emit_branch(prog, 0, targets);
        self.frames.push(ControlFrame {
            offset,
            kind,
            has_else: false,
        });
    }

    /// Starts a conditional block executed when `cond` holds
    pub fn if_begin(&mut self, prog: &mut ProgramBuffer, cond: IoCondition, targets: FlowTargets) {
        self.open_conditional(prog, cond, targets, FrameKind::If);
    }

    /// Emits the jump to the end of the conditional and resolves the pending test branch to the
    /// instruction after it. The top frame now points at that jump.
    fn close_branch(
        &mut self,
        prog: &mut ProgramBuffer,
        targets: FlowTargets,
        what: &str,
    ) -> Result<usize> {
        let top = self.top(&[FrameKind::If, FrameKind::ElseIf], what)?;
        if self.frames[top].has_else {
            return Err(Error::data(format!("{what} after the final else")));
        }
        let skip = Self::emit_branch(prog, 0, targets);
        prog.patch_address(self.frames[top].offset, prog.offset() as i32)?;
        self.frames[top].offset = skip;
        Ok(top)
    }

    /// Closes the current branch of the conditional and opens the fallback branch
    ///
    /// A conditional has at most one fallback, later `else` or `else-if` calls fail.
    pub fn if_else(&mut self, prog: &mut ProgramBuffer, targets: FlowTargets) -> Result<()> {
        let top = self.close_branch(prog, targets, "else")?;
        self.frames[top].has_else = true;
        Ok(())
    }

    /// Like [`Assembler::if_else`], then opens a new conditional for `cond`
    pub fn if_else_if(
        &mut self,
        prog: &mut ProgramBuffer,
        cond: IoCondition,
        targets: FlowTargets,
    ) -> Result<()> {
        self.close_branch(prog, targets, "else-if")?;
        self.open_conditional(prog, cond, targets, FrameKind::ElseIf);
        Ok(())
    }

    /// Resolves every pending jump of the innermost conditional to the current offset
    pub fn if_end(&mut self, prog: &mut ProgramBuffer) -> Result<()> {
        let chained = self
            .frames
            .iter()
            .rev()
            .take_while(|f| f.kind == FrameKind::ElseIf)
            .count();
        let head = self.frames.len().checked_sub(chained + 1);
        match head.map(|i| self.frames[i].kind) {
            Some(FrameKind::If) => {}
            Some(kind) => return Err(Error::data(format!("end-if inside open {kind:?}"))),
            None => return Err(Error::data("end-if without matching begin")),
        }

        let end = prog.offset() as i32;
        for _ in 0..=chained {
            if let Some(frame) = self.frames.pop() {
                prog.patch_address(frame.offset, end)?;
            }
        }
        Ok(())
    }

    /// Starts a loop that runs while `cond` holds
    pub fn while_begin(
        &mut self,
        prog: &mut ProgramBuffer,
        cond: IoCondition,
        targets: FlowTargets,
    ) {
        let offset = prog.offset();
        Self::emit_test(prog, cond, targets);
        Self::emit_branch(prog, 0, targets);
        self.frames.push(ControlFrame {
            offset,
            kind: FrameKind::While,
            has_else: false,
        });
    }

    pub fn while_end(&mut self, prog: &mut ProgramBuffer, targets: FlowTargets) -> Result<()> {
        let top = self.top(&[FrameKind::While], "end-while")?;
        let loop_top = self.frames[top].offset;
        Self::emit_branch(prog, loop_top as i32, targets);
        prog.patch_address(loop_top + INSTRUCTION_SIZE, prog.offset() as i32)?;
        self.frames.pop();
        Ok(())
    }

    /// Starts a body repeated `count` times by the target
    pub fn loop_begin(&mut self, prog: &mut ProgramBuffer, count: u16, targets: FlowTargets) {
        prog.push(&Instruction::new(opcode::SETLOOP, targets.flow, count));
        self.frames.push(ControlFrame {
            offset: prog.offset(),
            kind: FrameKind::DoLoopBody,
            has_else: false,
        });
    }

    pub fn loop_end(&mut self, prog: &mut ProgramBuffer, targets: FlowTargets) -> Result<()> {
        let top = self.top(&[FrameKind::DoLoopBody], "end-loop")?;
        let body = self.frames[top].offset;
        prog.push(&Instruction::new(opcode::DOLOOP, targets.flow, body as i32));
        self.frames.pop();
        Ok(())
    }

    /// Fails when a structure is still open
    pub fn ensure_closed(&self) -> Result<()> {
        match self.frames.last() {
            None => Ok(()),
            Some(f) => Err(Error::data(format!(
                "{:?} opened at offset {} is never closed",
                f.kind, f.offset
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const T: FlowTargets = FlowTargets { flow: 0, test: 1 };

    fn moveto(prog: &mut ProgramBuffer) {
        prog.push(&Instruction::new(opcode::MOVETO, 1, (10_000i32, 20_000i32)));
    }

    fn branch_at(prog: &ProgramBuffer, at: usize) -> i32 {
        let i = prog.instruction_at(at).unwrap();
        assert_eq!(i.opcode, opcode::BRANCH);
        i.operands::<i32>()
    }

    #[test]
    fn if_skips_to_end() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        asm.if_begin(&mut prog, IoCondition::equal(1, 0xffff), T);
        moveto(&mut prog);
        asm.if_end(&mut prog).unwrap();
        assert_eq!(asm.depth(), 0);
        assert_eq!(branch_at(&prog, 264), 280);
        let test = prog.instruction_at(256).unwrap();
        assert_eq!(test.opcode, opcode::TESTIO);
        assert_eq!(test.target, 1);
        assert_eq!(test.operands::<(i16, i16, i8, i8)>(), (1, -1, 1, 0));
    }

    #[test]
    fn else_if_chain_resolves_every_exit() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        asm.if_begin(&mut prog, IoCondition::equal(1, 3), T); // 256 test, 264 branch
        moveto(&mut prog); // 272
        asm.if_else_if(&mut prog, IoCondition::equal(2, 3), T).unwrap(); // 280 skip, 288 test, 296 branch
        moveto(&mut prog); // 304
        asm.if_else(&mut prog, T).unwrap(); // 312 skip
        moveto(&mut prog); // 320
        asm.if_end(&mut prog).unwrap(); // end at 328

        assert_eq!(asm.depth(), 0);
        assert_eq!(branch_at(&prog, 264), 288);
        assert_eq!(branch_at(&prog, 280), 328);
        assert_eq!(branch_at(&prog, 296), 320);
        assert_eq!(branch_at(&prog, 312), 328);
    }

    #[test]
    fn while_branches_back_to_test() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        asm.while_begin(&mut prog, IoCondition::not_equal(0, 1), T); // 256 test, 264 exit
        moveto(&mut prog); // 272
        asm.while_end(&mut prog, T).unwrap(); // 280 back
        assert_eq!(branch_at(&prog, 280), 256);
        assert_eq!(branch_at(&prog, 264), 288);
    }

    #[test]
    fn loops_nest_inside_conditionals() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        asm.if_begin(&mut prog, IoCondition::equal(1, 1), T); // 256, 264
        asm.loop_begin(&mut prog, 5, T); // 272 setloop, body at 280
        moveto(&mut prog); // 280
        asm.loop_end(&mut prog, T).unwrap(); // 288 doloop
        asm.if_end(&mut prog).unwrap();

        let setloop = prog.instruction_at(272).unwrap();
        assert_eq!(setloop.operands::<u16>(), 5);
        let doloop = prog.instruction_at(288).unwrap();
        assert_eq!(doloop.opcode, opcode::DOLOOP);
        assert_eq!(doloop.operands::<i32>(), 280);
        assert_eq!(branch_at(&prog, 264), 296);
    }

    #[test]
    fn unbalanced_calls_change_nothing() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        let e = asm.if_end(&mut prog).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Data);
        assert!(asm.if_else(&mut prog, T).is_err());
        assert!(prog.is_empty());

        asm.while_begin(&mut prog, IoCondition::equal(1, 1), T);
        let len = prog.len();
        assert!(asm.if_end(&mut prog).is_err());
        assert!(asm.loop_end(&mut prog, T).is_err());
        assert!(asm.if_else(&mut prog, T).is_err());
        assert_eq!(asm.depth(), 1);
        assert_eq!(prog.len(), len);
        assert!(asm.ensure_closed().is_err());

        asm.while_end(&mut prog, T).unwrap();
        assert!(asm.while_end(&mut prog, T).is_err());
        assert!(asm.ensure_closed().is_ok());
    }

    #[test]
    fn second_else_is_rejected() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        asm.if_begin(&mut prog, IoCondition::equal(1, 1), T); // 256 test, 264 branch
        moveto(&mut prog); // 272
        asm.if_else(&mut prog, T).unwrap(); // 280 skip
        moveto(&mut prog); // 288
        let len = prog.len();

        let e = asm.if_else(&mut prog, T).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Data);
        let e = asm
            .if_else_if(&mut prog, IoCondition::equal(2, 2), T)
            .unwrap_err();
        assert_eq!(e.code(), ErrorCode::Data);
        assert_eq!(asm.depth(), 1);
        assert_eq!(prog.len(), len);

        asm.if_end(&mut prog).unwrap(); // end at 296
        assert_eq!(asm.depth(), 0);
        assert_eq!(branch_at(&prog, 264), 288);
        assert_eq!(branch_at(&prog, 280), 296);
    }

    #[test]
    fn else_after_else_if_chain_is_final() {
        let mut prog = ProgramBuffer::new(4096);
        let mut asm = Assembler::new();
        asm.if_begin(&mut prog, IoCondition::equal(1, 1), T);
        asm.if_else_if(&mut prog, IoCondition::equal(2, 2), T).unwrap();
        asm.if_else(&mut prog, T).unwrap();
        assert!(asm.if_else(&mut prog, T).is_err());
        assert_eq!(asm.depth(), 2);
        asm.if_end(&mut prog).unwrap();
        assert!(asm.ensure_closed().is_ok());
    }
}
