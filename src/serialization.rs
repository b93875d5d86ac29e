//! Sequential binary model records.
//!
//! A model file is a flat big-endian stream with no compression:
//!
//! ```text
//! i32 layer_count
//! repeat layer_count:
//!     string type_tag
//!     <layer record>
//! string cost_tag
//! ```
//!
//! A layer record holds its input and output shapes, its hyperparameters,
//! its activation and optimizer tags, and for every parameter the optimizer
//! state followed by the values. Composite layers nest the same records for
//! their sub-layers. Strings are a `u16` byte length followed by UTF-8.

use crate::error::{NetworkError, Result};
use crate::tensor::Shape;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Writes record primitives to any byte sink.
pub struct ModelWriter<'a> {
    inner: &'a mut dyn Write,
}

impl<'a> ModelWriter<'a> {
    pub fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner }
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_i32::<BigEndian>(value)?;
        Ok(())
    }

    pub fn write_usize(&mut self, value: usize) -> Result<()> {
        let value = i32::try_from(value).map_err(|_| {
            NetworkError::Serialization(format!("value {} does not fit in an i32 field", value))
        })?;
        self.write_i32(value)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.inner.write_f32::<BigEndian>(value)?;
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.inner.write_u8(u8::from(value))?;
        Ok(())
    }

    pub fn write_str(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len())
            .map_err(|_| NetworkError::Serialization(format!("string too long: {}", value.len())))?;
        self.inner.write_u16::<BigEndian>(len)?;
        self.inner.write_all(value.as_bytes())?;
        Ok(())
    }

    pub fn write_shape(&mut self, shape: Shape) -> Result<()> {
        self.write_usize(shape.channels)?;
        self.write_usize(shape.height)?;
        self.write_usize(shape.width)
    }

    /// Writes values without a length prefix; the reader knows the count.
    pub fn write_values(&mut self, values: &[f32]) -> Result<()> {
        for &v in values {
            self.inner.write_f32::<BigEndian>(v)?;
        }
        Ok(())
    }

    /// Writes a length-prefixed buffer.
    pub fn write_vec(&mut self, values: &[f32]) -> Result<()> {
        self.write_usize(values.len())?;
        self.write_values(values)
    }
}

/// Reads record primitives; every I/O failure becomes a `Serialization` error.
pub struct ModelReader<'a> {
    inner: &'a mut dyn Read,
}

fn truncated(err: io::Error) -> NetworkError {
    NetworkError::Serialization(format!("truncated or unreadable model data: {}", err))
}

impl<'a> ModelReader<'a> {
    pub fn new(inner: &'a mut dyn Read) -> Self {
        Self { inner }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.inner.read_i32::<BigEndian>().map_err(truncated)
    }

    pub fn read_usize(&mut self) -> Result<usize> {
        let value = self.read_i32()?;
        usize::try_from(value)
            .map_err(|_| NetworkError::Serialization(format!("negative count {}", value)))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.inner.read_f32::<BigEndian>().map_err(truncated)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.inner.read_u8().map_err(truncated)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(NetworkError::Serialization(format!(
                "invalid boolean byte {}",
                other
            ))),
        }
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.inner.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes).map_err(truncated)?;
        String::from_utf8(bytes)
            .map_err(|e| NetworkError::Serialization(format!("invalid UTF-8 tag: {}", e)))
    }

    pub fn read_shape(&mut self) -> Result<Shape> {
        let channels = self.read_usize()?;
        let height = self.read_usize()?;
        let width = self.read_usize()?;
        let shape = Shape::new(channels, height, width);
        shape
            .validate()
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        Ok(shape)
    }

    /// Fills `values` completely.
    pub fn read_values_into(&mut self, values: &mut [f32]) -> Result<()> {
        for v in values.iter_mut() {
            *v = self.read_f32()?;
        }
        Ok(())
    }

    /// Reads a length-prefixed buffer. The buffer grows as values arrive, so
    /// a corrupt length fails at end of input instead of allocating up front.
    pub fn read_vec(&mut self) -> Result<Vec<f32>> {
        let len = self.read_usize()?;
        let mut values = Vec::new();
        for _ in 0..len {
            values.push(self.read_f32()?);
        }
        Ok(values)
    }
}

/// Fails with `Serialization` when a stored shape disagrees with the rebuilt one.
pub fn expect_shape(stored: Shape, rebuilt: Shape, what: &str) -> Result<()> {
    if stored != rebuilt {
        return Err(NetworkError::Serialization(format!(
            "{} shape mismatch: file has {}, layer binds to {}",
            what, stored, rebuilt
        )));
    }
    Ok(())
}
