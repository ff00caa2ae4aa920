use crate::opcode;
use crate::output_buffer::OutputBuffer;
use core::fmt;

/// Size of one encoded instruction record
pub const INSTRUCTION_SIZE: usize = 8;

/// Size of the operand area of an instruction record
pub const PAYLOAD_SIZE: usize = 6;

/// Operand bytes in wire order: `prm_X`, `prm_Y`, `prm_Xh`, `prm_Yh`
pub type Payload = [u8; PAYLOAD_SIZE];

/// Error type for representing a failed read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadError;

/// Trait implemented for types that can be read from a device reply
///
/// All fields on the wire are fixed width little-endian.
pub trait Readable: Sized {
    /// Attempt to read a `Self` from the input buffer, advancing the buffer if successful.
    ///
    /// If the operation fails, `data` is not advanced and a `ReadError` is returned.
    fn read(data: &mut &[u8]) -> Result<Self, ReadError>;
}

pub(crate) fn next_bytes<const N: usize>(data: &mut &[u8]) -> Result<[u8; N], ReadError> {
    if data.len() < N {
        return Err(ReadError);
    }
    let mut v = [0u8; N];
    v.copy_from_slice(&data[..N]);
    *data = &data[N..];
    Ok(v)
}

/// Trait implemented for types that can be written to an `OutputBuffer`
pub trait Writable {
    /// Outputs the value to an `OutputBuffer`
    fn write(&self, output: &mut impl OutputBuffer);
}

macro_rules! le_readwrite {
    ( $type:tt ) => {
        impl Readable for $type {
            fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
                next_bytes(data).map($type::from_le_bytes)
            }
        }

        impl Writable for $type {
            fn write(&self, output: &mut impl OutputBuffer) {
                output.output(&self.to_le_bytes())
            }
        }
    };
}

le_readwrite!(u8);
le_readwrite!(i8);
le_readwrite!(u16);
le_readwrite!(i16);
le_readwrite!(u32);
le_readwrite!(i32);
le_readwrite!(f32);
le_readwrite!(f64);

impl<const N: usize> Readable for [u8; N] {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        next_bytes(data)
    }
}

impl Writable for &[u8] {
    fn write(&self, output: &mut impl OutputBuffer) {
        output.output(self);
    }
}

/// Reads a NUL padded string field of `len` bytes
pub(crate) fn read_fixed_str(data: &mut &[u8], len: usize) -> Result<String, ReadError> {
    if data.len() < len {
        return Err(ReadError);
    }
    let field = &data[..len];
    *data = &data[len..];
    let end = field.iter().position(|b| *b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Writes `s` as a NUL padded field of `len` bytes, truncating to leave room for the terminator
pub(crate) fn write_fixed_str(output: &mut impl OutputBuffer, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    output.output(&bytes[..n]);
    for _ in n..len {
        output.output(&[0]);
    }
}

/// An operand shape that can be packed into the six operand bytes of an instruction
///
/// Packing only truncates to the field widths, it never validates ranges.
pub trait Operands: Sized {
    fn pack(&self) -> Payload;
    fn unpack(payload: &Payload) -> Self;
}

fn le16(p: &Payload, at: usize) -> [u8; 2] {
    [p[at], p[at + 1]]
}

fn le32(p: &Payload) -> [u8; 4] {
    [p[0], p[1], p[2], p[3]]
}

fn pack_parts(parts: &[&[u8]]) -> Payload {
    let mut p = [0u8; PAYLOAD_SIZE];
    let mut idx = 0;
    for part in parts {
        p[idx..idx + part.len()].copy_from_slice(part);
        idx += part.len();
    }
    p
}

impl Operands for () {
    fn pack(&self) -> Payload {
        [0; PAYLOAD_SIZE]
    }

    fn unpack(_payload: &Payload) -> Self {}
}

impl Operands for u16 {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.to_le_bytes()])
    }

    fn unpack(p: &Payload) -> Self {
        u16::from_le_bytes(le16(p, 0))
    }
}

impl Operands for i32 {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.to_le_bytes()])
    }

    fn unpack(p: &Payload) -> Self {
        i32::from_le_bytes(le32(p))
    }
}

impl Operands for f32 {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.to_le_bytes()])
    }

    fn unpack(p: &Payload) -> Self {
        f32::from_le_bytes(le32(p))
    }
}

impl Operands for (u16, u16) {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.0.to_le_bytes(), &self.1.to_le_bytes()])
    }

    fn unpack(p: &Payload) -> Self {
        (u16::from_le_bytes(le16(p, 0)), u16::from_le_bytes(le16(p, 2)))
    }
}

impl Operands for (i32, u16) {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.0.to_le_bytes(), &self.1.to_le_bytes()])
    }

    fn unpack(p: &Payload) -> Self {
        (i32::from_le_bytes(le32(p)), u16::from_le_bytes(le16(p, 4)))
    }
}

impl Operands for (f32, i16) {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.0.to_le_bytes(), &self.1.to_le_bytes()])
    }

    fn unpack(p: &Payload) -> Self {
        (f32::from_le_bytes(le32(p)), i16::from_le_bytes(le16(p, 4)))
    }
}

/// Coordinate pair with 24 significant bits per axis
///
/// The low 16 bits of each axis land in `prm_X`/`prm_Y`, bits 16..24 in `prm_Xh`/`prm_Yh`.
impl Operands for (i32, i32) {
    fn pack(&self) -> Payload {
        let x = self.0.to_le_bytes();
        let y = self.1.to_le_bytes();
        [x[0], x[1], y[0], y[1], x[2], y[2]]
    }

    fn unpack(p: &Payload) -> Self {
        let x = ((p[4] as i8 as i32) << 16) | u16::from_le_bytes(le16(p, 0)) as i32;
        let y = ((p[5] as i8 as i32) << 16) | u16::from_le_bytes(le16(p, 2)) as i32;
        (x, y)
    }
}

impl Operands for (i32, i8, i8) {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.0.to_le_bytes(), &[self.1 as u8, self.2 as u8]])
    }

    fn unpack(p: &Payload) -> Self {
        (i32::from_le_bytes(le32(p)), p[4] as i8, p[5] as i8)
    }
}

impl Operands for (f32, i8, i8) {
    fn pack(&self) -> Payload {
        pack_parts(&[&self.0.to_le_bytes(), &[self.1 as u8, self.2 as u8]])
    }

    fn unpack(p: &Payload) -> Self {
        (f32::from_le_bytes(le32(p)), p[4] as i8, p[5] as i8)
    }
}

impl Operands for (i16, i16, i8, i8) {
    fn pack(&self) -> Payload {
        pack_parts(&[
            &self.0.to_le_bytes(),
            &self.1.to_le_bytes(),
            &[self.2 as u8, self.3 as u8],
        ])
    }

    fn unpack(p: &Payload) -> Self {
        (
            i16::from_le_bytes(le16(p, 0)),
            i16::from_le_bytes(le16(p, 2)),
            p[4] as i8,
            p[5] as i8,
        )
    }
}

impl Operands for (i16, i16, i16) {
    fn pack(&self) -> Payload {
        pack_parts(&[
            &self.0.to_le_bytes(),
            &self.1.to_le_bytes(),
            &self.2.to_le_bytes(),
        ])
    }

    fn unpack(p: &Payload) -> Self {
        (
            i16::from_le_bytes(le16(p, 0)),
            i16::from_le_bytes(le16(p, 2)),
            i16::from_le_bytes(le16(p, 4)),
        )
    }
}

impl Operands for Payload {
    fn pack(&self) -> Payload {
        *self
    }

    fn unpack(p: &Payload) -> Self {
        *p
    }
}

/// One 8-byte instruction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    pub prm_x: u16,
    pub prm_y: u16,
    pub prm_xh: i8,
    pub prm_yh: i8,
    pub opcode: u8,
    pub target: u8,
}

impl Instruction {
    /// Encodes `operands` together with an opcode and a target mask
    pub fn new(opcode: u8, target: u8, operands: impl Operands) -> Self {
        Self::from_payload(operands.pack(), opcode, target)
    }

    /// An instruction with all operand fields zero
    pub fn bare(opcode: u8, target: u8) -> Self {
        Self::new(opcode, target, ())
    }

    fn from_payload(p: Payload, opcode: u8, target: u8) -> Self {
        Instruction {
            prm_x: u16::from_le_bytes([p[0], p[1]]),
            prm_y: u16::from_le_bytes([p[2], p[3]]),
            prm_xh: p[4] as i8,
            prm_yh: p[5] as i8,
            opcode,
            target,
        }
    }

    pub fn payload(&self) -> Payload {
        let x = self.prm_x.to_le_bytes();
        let y = self.prm_y.to_le_bytes();
        [x[0], x[1], y[0], y[1], self.prm_xh as u8, self.prm_yh as u8]
    }

    /// Decodes the operand fields as the shape `T`
    pub fn operands<T: Operands>(&self) -> T {
        T::unpack(&self.payload())
    }

    pub fn to_bytes(&self) -> [u8; INSTRUCTION_SIZE] {
        let p = self.payload();
        [p[0], p[1], p[2], p[3], p[4], p[5], self.opcode, self.target]
    }

    pub fn from_bytes(b: &[u8; INSTRUCTION_SIZE]) -> Self {
        let mut p = [0u8; PAYLOAD_SIZE];
        p.copy_from_slice(&b[..PAYLOAD_SIZE]);
        Self::from_payload(p, b[6], b[7])
    }

    /// True for out-of-band requests handled by the board's communication layer
    pub fn is_interrupt(&self) -> bool {
        opcode::is_interrupt(self.opcode)
    }
}

impl Readable for Instruction {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        next_bytes(data).map(|b| Instruction::from_bytes(&b))
    }
}

impl Writable for Instruction {
    fn write(&self, output: &mut impl OutputBuffer) {
        output.output(&self.to_bytes())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match opcode::mnemonic(self.opcode) {
            Some(name) => write!(f, "{name:<14}")?,
            None => write!(f, "OP_{:02X}{:<9}", self.opcode, "")?,
        }
        write!(
            f,
            " x={:#06x} y={:#06x} xh={} yh={} tgt={:#04x}",
            self.prm_x, self.prm_y, self.prm_xh, self.prm_yh, self.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_little_endian() {
        let i = Instruction::new(opcode::MOVETO, 0x01, (0x0012_3456, -2i32));
        assert_eq!(
            i.to_bytes(),
            [0x56, 0x34, 0xfe, 0xff, 0x12, 0xff, opcode::MOVETO, 0x01]
        );
        assert_eq!(i.operands::<(i32, i32)>(), (0x0012_3456, -2));
    }

    #[test]
    fn coordinate_pair_keeps_24_bits() {
        let i = Instruction::new(opcode::LINETO, 0, (-8_388_608i32, 8_388_607i32));
        assert_eq!(i.operands::<(i32, i32)>(), (-8_388_608, 8_388_607));
        assert_eq!(i.prm_xh, -128);
        assert_eq!(i.prm_yh, 127);
    }

    #[test]
    fn shapes_decode_to_what_was_packed() {
        let i = Instruction::new(opcode::SETSPEED, 0, (1.5f32, -7i16));
        assert_eq!(i.operands::<(f32, i16)>(), (1.5, -7));

        let i = Instruction::new(opcode::IDXFETCH, 0, (-123_456i32, 0xbeefu16));
        assert_eq!(i.operands::<(i32, u16)>(), (-123_456, 0xbeef));

        let i = Instruction::new(opcode::SETOSC, 0, (7i32, -1i8, 3i8));
        assert_eq!(i.operands::<(i32, i8, i8)>(), (7, -1, 3));

        let i = Instruction::new(opcode::SETFS, 0, (0.25f32, 2i8, -2i8));
        assert_eq!(i.operands::<(f32, i8, i8)>(), (0.25, 2, -2));

        let i = Instruction::new(opcode::SETDELAYS, 0, (-1i16, 300i16, 4i8, -5i8));
        assert_eq!(i.operands::<(i16, i16, i8, i8)>(), (-1, 300, 4, -5));

        let i = Instruction::new(opcode::SETWOBBLE, 0, (1i16, -2i16, 3i16));
        assert_eq!(i.operands::<(i16, i16, i16)>(), (1, -2, 3));

        let i = Instruction::new(opcode::BSTRN, 0, *b"abcdef");
        assert_eq!(&i.operands::<Payload>(), b"abcdef");

        let i = Instruction::new(opcode::SETIO, 0, (0x00ffu16, 0x0f0fu16));
        assert_eq!(i.operands::<(u16, u16)>(), (0x00ff, 0x0f0f));
        assert_eq!(i.operands::<u16>(), 0x00ff);
    }

    #[test]
    fn float_bits_share_the_word_slot() {
        let i = Instruction::new(opcode::SPEED, 0, 1000.0f32);
        assert_eq!(i.operands::<i32>(), 1000.0f32.to_bits() as i32);
    }

    #[test]
    fn read_advances_only_on_success() {
        let bytes = Instruction::new(opcode::SLEEP, 3, 250i32).to_bytes();
        let mut data = &bytes[..];
        let i = Instruction::read(&mut data).unwrap();
        assert!(data.is_empty());
        assert_eq!(i.operands::<i32>(), 250);

        let mut short = &bytes[..5];
        assert_eq!(Instruction::read(&mut short), Err(ReadError));
        assert_eq!(short.len(), 5);
    }

    #[test]
    fn fixed_strings_are_nul_padded() {
        let mut out = Vec::new();
        write_fixed_str(&mut out, "demo", 8);
        assert_eq!(out, b"demo\0\0\0\0");
        let mut data = &out[..];
        assert_eq!(read_fixed_str(&mut data, 8).unwrap(), "demo");
        assert!(data.is_empty());
    }

    #[test]
    fn display_uses_mnemonic() {
        let s = Instruction::bare(opcode::EOF, 0).to_string();
        assert!(s.starts_with("EOF"));
    }
}
