//! Binary image format: serialization and deserialization.
//!
//! All multi-byte integers are little-endian. Doubles are IEEE-754 binary64
//! in their native little-endian byte layout. The layout is fixed by the
//! image format version and must round-trip bit-for-bit.

use crate::bytecode::image::{BytecodeImage, Constant, FunctionInfo, Instruction, MAGIC};
use crate::error::ImageError;

/// Serialize an image to its binary form.
pub fn serialize(image: &BytecodeImage) -> Vec<u8> {
    let mut w = Writer::new();

    // Header
    w.u32(MAGIC);
    w.u16(image.version);
    w.u16(image.flags);

    // Code section
    w.u32(image.code.len() as u32);
    for instr in &image.code {
        w.u8(instr.opcode);
        w.u32(instr.operand);
    }

    // Constants
    w.u32(image.constants.len() as u32);
    for constant in &image.constants {
        w.u8(constant.type_tag());
        match constant {
            Constant::Int(v) => w.i64(*v),
            Constant::Float(v) => w.f64(*v),
            Constant::Bool(v) => w.u8(*v as u8),
            Constant::Str(idx)
            | Constant::IntArray(idx)
            | Constant::FloatArray(idx)
            | Constant::StrArray(idx) => w.u32(*idx),
            Constant::Nil => w.zeros(8),
        }
    }

    // String pool
    w.u32(image.strings.len() as u32);
    for s in &image.strings {
        w.bytes_with_len(s.as_bytes());
    }

    // Array pools
    w.u32(image.int_arrays.len() as u32);
    for arr in &image.int_arrays {
        w.u32(arr.len() as u32);
        for v in arr {
            w.i64(*v);
        }
    }

    w.u32(image.float_arrays.len() as u32);
    for arr in &image.float_arrays {
        w.u32(arr.len() as u32);
        for v in arr {
            w.f64(*v);
        }
    }

    w.u32(image.string_arrays.len() as u32);
    for arr in &image.string_arrays {
        w.u32(arr.len() as u32);
        for s in arr {
            w.bytes_with_len(s.as_bytes());
        }
    }

    // Function table
    w.u32(image.functions.len() as u32);
    for func in &image.functions {
        w.bytes_with_len(func.name.as_bytes());
        w.u32(func.address);
        w.u8(func.arity);
        w.u8(func.locals);
    }

    // Native imports
    w.u32(image.native_imports.len() as u32);
    for name in &image.native_imports {
        w.bytes_with_len(name.as_bytes());
    }

    w.finish()
}

/// Deserialize an image from its binary form.
pub fn deserialize(data: &[u8]) -> Result<BytecodeImage, ImageError> {
    let mut r = Reader::new(data);
    let mut image = BytecodeImage::new();

    // Header
    let magic = r.u32("header")?;
    if magic != MAGIC {
        return Err(ImageError::BadMagic(magic));
    }
    image.version = r.u16("header")?;
    image.flags = r.u16("header")?;

    // Code section
    let code_len = r.u32("code length")?;
    image.code.reserve(code_len as usize);
    for _ in 0..code_len {
        let opcode = r.u8("instruction")?;
        let operand = r.u32("instruction")?;
        image.code.push(Instruction { opcode, operand });
    }

    // Constants
    let const_len = r.u32("constant count")?;
    image.constants.reserve(const_len as usize);
    for _ in 0..const_len {
        let tag = r.u8("constant tag")?;
        let constant = match tag {
            0 => {
                r.skip(8, "nil constant")?;
                Constant::Nil
            }
            1 => Constant::Int(r.i64("int constant")?),
            2 => Constant::Float(r.f64("float constant")?),
            3 => Constant::Bool(r.u8("bool constant")? != 0),
            4 => Constant::Str(r.u32("string constant")?),
            5 => Constant::IntArray(r.u32("array constant")?),
            6 => Constant::FloatArray(r.u32("array constant")?),
            7 => Constant::StrArray(r.u32("array constant")?),
            other => return Err(ImageError::UnknownConstantType(other)),
        };
        image.constants.push(constant);
    }

    // String pool
    let str_len = r.u32("string count")?;
    image.strings.reserve(str_len as usize);
    for _ in 0..str_len {
        image.strings.push(r.string("string pool entry")?);
    }

    // Array pools
    let int_arrays = r.u32("int array count")?;
    for _ in 0..int_arrays {
        let len = r.u32("int array length")?;
        let mut arr = Vec::with_capacity(len as usize);
        for _ in 0..len {
            arr.push(r.i64("int array element")?);
        }
        image.int_arrays.push(arr);
    }

    let float_arrays = r.u32("float array count")?;
    for _ in 0..float_arrays {
        let len = r.u32("float array length")?;
        let mut arr = Vec::with_capacity(len as usize);
        for _ in 0..len {
            arr.push(r.f64("float array element")?);
        }
        image.float_arrays.push(arr);
    }

    let string_arrays = r.u32("string array count")?;
    for _ in 0..string_arrays {
        let len = r.u32("string array length")?;
        let mut arr = Vec::with_capacity(len as usize);
        for _ in 0..len {
            arr.push(r.string("string array element")?);
        }
        image.string_arrays.push(arr);
    }

    // Function table
    let func_len = r.u32("function count")?;
    for _ in 0..func_len {
        let name = r.string("function name")?;
        let address = r.u32("function address")?;
        let arity = r.u8("function arity")?;
        let locals = r.u8("function locals")?;
        image.functions.push(FunctionInfo {
            name,
            address,
            arity,
            locals,
        });
    }

    // Native imports
    let native_len = r.u32("native import count")?;
    for _ in 0..native_len {
        image.native_imports.push(r.string("native import")?);
    }

    if !r.at_end() {
        eprintln!("Warning: {} extra bytes in bytecode file", r.remaining());
    }

    Ok(image)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn zeros(&mut self, n: usize) {
        self.buf.extend(std::iter::repeat(0u8).take(n));
    }

    fn bytes_with_len(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ImageError> {
        if self.pos + n > self.data.len() {
            return Err(ImageError::Truncated(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), ImageError> {
        self.take(n, what).map(|_| ())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ImageError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ImageError> {
        Ok(u16::from_le_bytes(self.take(2, what)?.try_into().unwrap()))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ImageError> {
        Ok(u32::from_le_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, ImageError> {
        Ok(i64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    fn f64(&mut self, what: &'static str) -> Result<f64, ImageError> {
        Ok(f64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    fn string(&mut self, what: &'static str) -> Result<String, ImageError> {
        let len = self.u32(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ImageError::InvalidUtf8)
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
