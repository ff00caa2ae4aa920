//! Opcode numbers of the controller instruction set
//!
//! List opcodes (`0x00..0x80` and [`EOF`]) are executed in order by the target's command
//! processor. Interrupt opcodes (`0x80..`) are handled immediately by the communication layer of
//! the board; those with bit 6 set produce a reply.

use lazy_static::lazy_static;
use std::collections::BTreeMap;

pub const NOP: u8 = 0x00;
pub const SETIO: u8 = 0x02;
pub const SETSPEED: u8 = 0x03;
pub const JUMPTO: u8 = 0x04;
pub const MOVETO: u8 = 0x05;
pub const PULSTO: u8 = 0x06;
pub const LINETO: u8 = 0x07;
pub const PARAMS: u8 = 0x08;
pub const ARCMOVE: u8 = 0x09;
pub const ARCLINE: u8 = 0x0a;
pub const SPEED: u8 = 0x0b;
pub const JUMPSPEED: u8 = 0x0c;
pub const SETOSC: u8 = 0x0d;
pub const SETLOOP: u8 = 0x0e;
pub const DOLOOP: u8 = 0x0f;
pub const SLEEP: u8 = 0x10;
pub const SUSPEND: u8 = 0x11;
pub const SETDELAYS: u8 = 0x12;
pub const SETLIDLE: u8 = 0x13;
pub const SM_LASER: u8 = 0x14;
pub const EXCHLLINK: u8 = 0x15;
pub const TABLESET: u8 = 0x16;
pub const TABLESSIZE: u8 = 0x17;
pub const TABLEDELAY: u8 = 0x18;
pub const TABLE1D: u8 = 0x19;
pub const SETFDATA: u8 = 0x1a;
pub const TABLEMOVETO: u8 = 0x1b;
pub const SETIMGAIJ: u8 = 0x1c;
pub const SETIMGROT: u8 = 0x1d;
pub const SETIMGOFFS: u8 = 0x1e;
pub const SETIMGOFFSR: u8 = 0x1f;
pub const SETIMGOFFSZ: u8 = 0x20;
pub const SETFS: u8 = 0x21;
pub const SETFSZ: u8 = 0x22;
pub const SETSPFLTR: u8 = 0x23;
pub const BURST: u8 = 0x24;
pub const IDXFETCH: u8 = 0x25;
pub const LIST: u8 = 0x26;
pub const SETCNTR: u8 = 0x27;
pub const SETANA: u8 = 0x28;
pub const CFG_IO: u8 = 0x29;
pub const OTFSTEP: u8 = 0x2a;
pub const OTFRANGE: u8 = 0x2b;
pub const OTFSET: u8 = 0x2c;
pub const WAITIO: u8 = 0x2d;
pub const OTFWAIT: u8 = 0x2e;
pub const OTFENABLE: u8 = 0x2f;
pub const SETMINGATE: u8 = 0x30;
pub const SETBULGE: u8 = 0x31;
pub const SETDDELAY: u8 = 0x32;
pub const CIRCLE: u8 = 0x33;
pub const TABLEJOG: u8 = 0x34;
pub const TABLELINETO: u8 = 0x35;
pub const TABLEJUMPTO: u8 = 0x36;
pub const TABLEARCLINE: u8 = 0x37;
pub const BRANCH: u8 = 0x38;
pub const SETAIJ: u8 = 0x39;
pub const SETROT: u8 = 0x3a;
pub const SETOFFS: u8 = 0x3b;
pub const SETOFFSZ: u8 = 0x3c;
pub const SETWOBBLE: u8 = 0x3d;
pub const JUMPTO3D: u8 = 0x3e;
pub const MOVETO3D: u8 = 0x3f;
pub const PULSTO3D: u8 = 0x40;
pub const LINETO3D: u8 = 0x41;
pub const TABLEWHILEIO: u8 = 0x42;
pub const BSTR0: u8 = 0x43;
pub const BSTRN: u8 = 0x44;
pub const UDPSEND: u8 = 0x45;
pub const TABLESNAP: u8 = 0x46;
pub const TABLEJUMP3D: u8 = 0x47;
pub const WHILEIO: u8 = 0x48;
pub const SETLASERDELAY: u8 = 0x49;
pub const CCODE_BEGIN: u8 = 0x4a;
pub const CCODE_END: u8 = 0x4b;
pub const CHAR: u8 = 0x4c;
pub const CHAR_END: u8 = 0x4d;
pub const FONTHDR: u8 = 0x4e;
pub const VAR_CALL: u8 = 0x4f;
pub const VAR_SET: u8 = 0x50;
pub const TESTIO: u8 = 0x51;
pub const CAN_INIT: u8 = 0x52;
pub const CAN_SEND: u8 = 0x53;
pub const IDXUPLOAD: u8 = 0x54;
pub const PRINT: u8 = 0x55;
pub const CAN_SCAN: u8 = 0x56;
pub const CAN_WAIT: u8 = 0x57;
pub const EOF: u8 = 0xff;

pub const INT_SUSPEND: u8 = 0x81;
pub const INT_RESUME: u8 = 0x82;
pub const INT_ABORT: u8 = 0x83;
pub const INT_DEFLWR: u8 = 0x84;
pub const INT_RUNMODE: u8 = 0x85;
pub const INT_SETIO: u8 = 0x89;
pub const INT_UARTOPEN: u8 = 0x8a;
pub const INT_UARTWRITE: u8 = 0x8b;
pub const INT_EXCHLLINK: u8 = 0x8c;
pub const INT_TESTIO: u8 = 0x8d;
pub const INT_WAITIDLE: u8 = 0x8e;
pub const INT_MAPTGT: u8 = 0x8f;
pub const INT_SCANTGT: u8 = 0x90;
pub const INT_UDPSEND: u8 = 0x91;
pub const INT_WAITIO: u8 = 0x92;
pub const INT_CHSETPOINTS: u8 = 0x93;
pub const INT_CHTESTPARAMS: u8 = 0x94;
pub const INT_SELFILE: u8 = 0x95;
pub const INT_WAITSTALL: u8 = 0x96;
pub const INT_OTFSPEED: u8 = 0x97;

pub const INT_STATUS: u8 = 0xc0;
pub const INT_TGTSTATUS: u8 = 0xc1;
pub const INT_DEFLEXCH: u8 = 0xc2;
pub const INT_FLASHRD: u8 = 0xc4;
pub const INT_GTID: u8 = 0xc5;
pub const INT_UARTREAD: u8 = 0xc7;
pub const INT_SCANREAD: u8 = 0xc8;
pub const INT_GETIP: u8 = 0xc9;
pub const INT_ADDCALDATA: u8 = 0xca;
pub const INT_STORECALFILE: u8 = 0xcb;
pub const INT_LOADCALFILE: u8 = 0xcc;
pub const INT_RESETCAL: u8 = 0xcd;
pub const INT_FLASHPP2: u8 = 0xce;
pub const INT_CHFLASHRD: u8 = 0xcf;
pub const INT_CHFLASHPP: u8 = 0xd0;
pub const INT_CHACTUALS: u8 = 0xd1;
pub const INT_CANREAD: u8 = 0xd4;

/// Bit marking an opcode as an interrupt request
pub const INTERRUPT: u8 = 0x80;

/// Target mask addressing every board
pub const TARGET_ALL: u8 = 0xff;

/// Unlock code carried by run-mode and target-mapping requests
pub const SCODE: u16 = 0xa5d2;

/// File index that selects no start file; keeps IO from launching a program
pub const NO_FILE: u16 = 250;

/// Returns true for opcodes the board handles out of band
pub fn is_interrupt(opcode: u8) -> bool {
    opcode != EOF && opcode & INTERRUPT != 0
}

lazy_static! {
    static ref MNEMONICS: BTreeMap<u8, &'static str> = BTreeMap::from([
        (NOP, "NOP"),
        (SETIO, "SETIO"),
        (SETSPEED, "SETSPEED"),
        (JUMPTO, "JUMPTO"),
        (MOVETO, "MOVETO"),
        (PULSTO, "PULSTO"),
        (LINETO, "LINETO"),
        (PARAMS, "PARAMS"),
        (ARCMOVE, "ARCMOVE"),
        (ARCLINE, "ARCLINE"),
        (SPEED, "SPEED"),
        (JUMPSPEED, "JUMPSPEED"),
        (SETOSC, "SETOSC"),
        (SETLOOP, "SETLOOP"),
        (DOLOOP, "DOLOOP"),
        (SLEEP, "SLEEP"),
        (SUSPEND, "SUSPEND"),
        (SETDELAYS, "SETDELAYS"),
        (SETLIDLE, "SETLIDLE"),
        (SM_LASER, "SM_LASER"),
        (EXCHLLINK, "EXCHLLINK"),
        (TABLESET, "TABLESET"),
        (TABLESSIZE, "TABLESSIZE"),
        (TABLEDELAY, "TABLEDELAY"),
        (TABLE1D, "TABLE1D"),
        (SETFDATA, "SETFDATA"),
        (TABLEMOVETO, "TABLEMOVETO"),
        (SETIMGAIJ, "SETIMGAIJ"),
        (SETIMGROT, "SETIMGROT"),
        (SETIMGOFFS, "SETIMGOFFS"),
        (SETIMGOFFSR, "SETIMGOFFSR"),
        (SETIMGOFFSZ, "SETIMGOFFSZ"),
        (SETFS, "SETFS"),
        (SETFSZ, "SETFSZ"),
        (SETSPFLTR, "SETSPFLTR"),
        (BURST, "BURST"),
        (IDXFETCH, "IDXFETCH"),
        (LIST, "LIST"),
        (SETCNTR, "SETCNTR"),
        (SETANA, "SETANA"),
        (CFG_IO, "CFG_IO"),
        (OTFSTEP, "OTFSTEP"),
        (OTFRANGE, "OTFRANGE"),
        (OTFSET, "OTFSET"),
        (WAITIO, "WAITIO"),
        (OTFWAIT, "OTFWAIT"),
        (OTFENABLE, "OTFENABLE"),
        (SETMINGATE, "SETMINGATE"),
        (SETBULGE, "SETBULGE"),
        (SETDDELAY, "SETDDELAY"),
        (CIRCLE, "CIRCLE"),
        (TABLEJOG, "TABLEJOG"),
        (TABLELINETO, "TABLELINETO"),
        (TABLEJUMPTO, "TABLEJUMPTO"),
        (TABLEARCLINE, "TABLEARCLINE"),
        (BRANCH, "BRANCH"),
        (SETAIJ, "SETAIJ"),
        (SETROT, "SETROT"),
        (SETOFFS, "SETOFFS"),
        (SETOFFSZ, "SETOFFSZ"),
        (SETWOBBLE, "SETWOBBLE"),
        (JUMPTO3D, "JUMPTO3D"),
        (MOVETO3D, "MOVETO3D"),
        (PULSTO3D, "PULSTO3D"),
        (LINETO3D, "LINETO3D"),
        (TABLEWHILEIO, "TABLEWHILEIO"),
        (BSTR0, "BSTR0"),
        (BSTRN, "BSTRN"),
        (UDPSEND, "UDPSEND"),
        (TABLESNAP, "TABLESNAP"),
        (TABLEJUMP3D, "TABLEJUMP3D"),
        (WHILEIO, "WHILEIO"),
        (SETLASERDELAY, "SETLASERDELAY"),
        (CCODE_BEGIN, "CCODE_BEGIN"),
        (CCODE_END, "CCODE_END"),
        (CHAR, "CHAR"),
        (CHAR_END, "CHAR_END"),
        (FONTHDR, "FONTHDR"),
        (VAR_CALL, "VAR_CALL"),
        (VAR_SET, "VAR_SET"),
        (TESTIO, "TESTIO"),
        (CAN_INIT, "CAN_INIT"),
        (CAN_SEND, "CAN_SEND"),
        (IDXUPLOAD, "IDXUPLOAD"),
        (PRINT, "PRINT"),
        (CAN_SCAN, "CAN_SCAN"),
        (CAN_WAIT, "CAN_WAIT"),
        (EOF, "EOF"),
        (INT_SUSPEND, "INT_SUSPEND"),
        (INT_RESUME, "INT_RESUME"),
        (INT_ABORT, "INT_ABORT"),
        (INT_DEFLWR, "INT_DEFLWR"),
        (INT_RUNMODE, "INT_RUNMODE"),
        (INT_SETIO, "INT_SETIO"),
        (INT_UARTOPEN, "INT_UARTOPEN"),
        (INT_UARTWRITE, "INT_UARTWRITE"),
        (INT_EXCHLLINK, "INT_EXCHLLINK"),
        (INT_TESTIO, "INT_TESTIO"),
        (INT_WAITIDLE, "INT_WAITIDLE"),
        (INT_MAPTGT, "INT_MAPTGT"),
        (INT_SCANTGT, "INT_SCANTGT"),
        (INT_UDPSEND, "INT_UDPSEND"),
        (INT_WAITIO, "INT_WAITIO"),
        (INT_CHSETPOINTS, "INT_CHSETPOINTS"),
        (INT_CHTESTPARAMS, "INT_CHTESTPARAMS"),
        (INT_SELFILE, "INT_SELFILE"),
        (INT_WAITSTALL, "INT_WAITSTALL"),
        (INT_OTFSPEED, "INT_OTFSPEED"),
        (INT_STATUS, "INT_STATUS"),
        (INT_TGTSTATUS, "INT_TGTSTATUS"),
        (INT_DEFLEXCH, "INT_DEFLEXCH"),
        (INT_FLASHRD, "INT_FLASHRD"),
        (INT_GTID, "INT_GTID"),
        (INT_UARTREAD, "INT_UARTREAD"),
        (INT_SCANREAD, "INT_SCANREAD"),
        (INT_GETIP, "INT_GETIP"),
        (INT_ADDCALDATA, "INT_ADDCALDATA"),
        (INT_STORECALFILE, "INT_STORECALFILE"),
        (INT_LOADCALFILE, "INT_LOADCALFILE"),
        (INT_RESETCAL, "INT_RESETCAL"),
        (INT_FLASHPP2, "INT_FLASHPP2"),
        (INT_CHFLASHRD, "INT_CHFLASHRD"),
        (INT_CHFLASHPP, "INT_CHFLASHPP"),
        (INT_CHACTUALS, "INT_CHACTUALS"),
        (INT_CANREAD, "INT_CANREAD"),
    ]);
}

/// Looks up the mnemonic of an opcode
pub fn mnemonic(opcode: u8) -> Option<&'static str> {
    MNEMONICS.get(&opcode).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_cover_core_table() {
        assert_eq!(mnemonic(MOVETO), Some("MOVETO"));
        assert_eq!(mnemonic(BRANCH), Some("BRANCH"));
        assert_eq!(mnemonic(INT_FLASHPP2), Some("INT_FLASHPP2"));
        assert_eq!(mnemonic(0x7f), None);
    }

    #[test]
    fn interrupt_space_excludes_eof() {
        assert!(is_interrupt(INT_ABORT));
        assert!(is_interrupt(INT_STATUS));
        assert!(!is_interrupt(TESTIO));
        assert!(!is_interrupt(EOF));
    }
}
