//! Bit and symbol packing.
//!
//! A byte stream is read as a bit stream and cut into symbols of
//! `modulus` bits (1 to 8), one symbol per output byte. With
//! [`BitOrder::Msb`] each byte contributes its bits high to low and a
//! symbol's first bit is its most significant; with [`BitOrder::Lsb`]
//! both run low to high.

use crate::block::{Block, BlockError, PortDecl, WorkContext};
use crate::chunk::TypedChunk;
use crate::dtype::DType;
use crate::label::Label;
use crate::message::{Message, Packet};
use crate::port::{InputPort, OutputPort};
use crate::registry::{BlockFactory, BlockRegistry};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

/// Symbol conversion failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("modulus must be between 1 and 8 inclusive, got {0}")]
    Modulus(u64),
    #[error("bit order must be MSBit or LSBit, got {0:?}")]
    Order(String),
}

impl From<SymbolError> for BlockError {
    fn from(err: SymbolError) -> Self {
        BlockError::new(err)
    }
}

/// Which end of a byte or symbol comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    Msb,
    Lsb,
}

impl FromStr for BitOrder {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MSBit" | "MSB" => Ok(BitOrder::Msb),
            "LSBit" | "LSB" => Ok(BitOrder::Lsb),
            other => Err(SymbolError::Order(other.to_string())),
        }
    }
}

fn check_modulus(modulus: u8) -> Result<(), SymbolError> {
    if (1..=8).contains(&modulus) {
        Ok(())
    } else {
        Err(SymbolError::Modulus(modulus.into()))
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Smallest (bytes, symbols) pair that converts without leftover bits.
pub fn packing_group(modulus: u8) -> (usize, usize) {
    let m = usize::from(modulus.clamp(1, 8));
    let g = gcd(m, 8);
    (m / g, 8 / g)
}

#[inline]
fn stream_bit(bytes: &[u8], j: usize, order: BitOrder) -> u8 {
    let byte = bytes[j / 8];
    match order {
        BitOrder::Msb => (byte >> (7 - j % 8)) & 1,
        BitOrder::Lsb => (byte >> (j % 8)) & 1,
    }
}

#[inline]
fn set_stream_bit(bytes: &mut [u8], j: usize, order: BitOrder) {
    match order {
        BitOrder::Msb => bytes[j / 8] |= 0x80 >> (j % 8),
        BitOrder::Lsb => bytes[j / 8] |= 1 << (j % 8),
    }
}

/// Unpack bytes into `bytes.len() * 8 / modulus` symbols.
pub fn bytes_to_symbols(modulus: u8, order: BitOrder, bytes: &[u8]) -> Result<Vec<u8>, SymbolError> {
    check_modulus(modulus)?;
    let k = usize::from(modulus);
    let count = bytes.len() * 8 / k;
    let mut symbols = Vec::with_capacity(count);
    for i in 0..count {
        let mut symbol = 0u8;
        for t in 0..k {
            let bit = stream_bit(bytes, k * i + t, order);
            symbol |= match order {
                BitOrder::Msb => bit << (k - 1 - t),
                BitOrder::Lsb => bit << t,
            };
        }
        symbols.push(symbol);
    }
    Ok(symbols)
}

/// Pack symbols into `symbols.len() * modulus / 8` bytes. Bits above the
/// modulus are ignored.
pub fn symbols_to_bytes(modulus: u8, order: BitOrder, symbols: &[u8]) -> Result<Vec<u8>, SymbolError> {
    check_modulus(modulus)?;
    let k = usize::from(modulus);
    let mut bytes = vec![0u8; symbols.len() * k / 8];
    let total_bits = bytes.len() * 8;
    for (i, symbol) in symbols.iter().enumerate() {
        for t in 0..k {
            let j = k * i + t;
            if j >= total_bits {
                return Ok(bytes);
            }
            let bit = match order {
                BitOrder::Msb => (symbol >> (k - 1 - t)) & 1,
                BitOrder::Lsb => (symbol >> t) & 1,
            };
            if bit != 0 {
                set_stream_bit(&mut bytes, j, order);
            }
        }
    }
    Ok(bytes)
}

/// Pack one bit per input byte (non-zero is 1) into symbols of `modulus` bits.
pub fn bits_to_symbols(modulus: u8, order: BitOrder, bits: &[u8]) -> Result<Vec<u8>, SymbolError> {
    check_modulus(modulus)?;
    let k = usize::from(modulus);
    Ok(bits
        .chunks_exact(k)
        .map(|group| {
            group.iter().enumerate().fold(0u8, |symbol, (t, &bit)| {
                let bit = u8::from(bit != 0);
                match order {
                    BitOrder::Msb => symbol | (bit << (k - 1 - t)),
                    BitOrder::Lsb => symbol | (bit << t),
                }
            })
        })
        .collect())
}

/// Expand each symbol into `modulus` bytes holding 0 or 1.
pub fn symbols_to_bits(modulus: u8, order: BitOrder, symbols: &[u8]) -> Result<Vec<u8>, SymbolError> {
    check_modulus(modulus)?;
    let k = usize::from(modulus);
    let mut bits = Vec::with_capacity(symbols.len() * k);
    for symbol in symbols {
        for t in 0..k {
            bits.push(match order {
                BitOrder::Msb => (symbol >> (k - 1 - t)) & 1,
                BitOrder::Lsb => (symbol >> t) & 1,
            });
        }
    }
    Ok(bits)
}

/// Which packing a [`SymbolBlock`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    BytesToSymbols,
    SymbolsToBytes,
    BitsToSymbols,
    SymbolsToBits,
}

impl Conversion {
    /// Registry path of the block performing this conversion.
    pub fn path(self) -> &'static str {
        match self {
            Conversion::BytesToSymbols => "/blocks/bytes_to_symbols",
            Conversion::SymbolsToBytes => "/blocks/symbols_to_bytes",
            Conversion::BitsToSymbols => "/blocks/bits_to_symbols",
            Conversion::SymbolsToBits => "/blocks/symbols_to_bits",
        }
    }

    fn default_order(self) -> BitOrder {
        match self {
            Conversion::BytesToSymbols | Conversion::SymbolsToBytes => BitOrder::Lsb,
            Conversion::BitsToSymbols | Conversion::SymbolsToBits => BitOrder::Msb,
        }
    }
}

/// Stream block converting between bytes, bits and symbols.
///
/// Input and output are `uint8`. Labels and packet payloads are rescaled
/// by the conversion ratio.
#[derive(Debug, Clone)]
pub struct SymbolBlock {
    conversion: Conversion,
    modulus: u8,
    order: BitOrder,
}

impl SymbolBlock {
    pub fn new(conversion: Conversion, modulus: u8, order: BitOrder) -> Result<Self, SymbolError> {
        check_modulus(modulus)?;
        Ok(Self {
            conversion,
            modulus,
            order,
        })
    }

    /// Build from registry arguments `[modulus, order?]`.
    pub fn from_args(conversion: Conversion, args: &[Value]) -> Result<Self, BlockError> {
        let modulus = match args.first() {
            None => 1,
            Some(value) => {
                let raw = value
                    .as_u64()
                    .ok_or_else(|| BlockError::new(format!("modulus must be an integer, got {value}")))?;
                u8::try_from(raw).map_err(|_| SymbolError::Modulus(raw))?
            }
        };
        let order = match args.get(1) {
            None => conversion.default_order(),
            Some(Value::String(s)) => s.parse()?,
            Some(other) => return Err(BlockError::new(format!("bit order must be a string, got {other}"))),
        };
        Ok(Self::new(conversion, modulus, order)?)
    }

    pub fn modulus(&self) -> u8 {
        self.modulus
    }

    pub fn order(&self) -> BitOrder {
        self.order
    }

    /// Input and output element counts of one indivisible step.
    pub fn ratio(&self) -> (usize, usize) {
        let (bytes, symbols) = packing_group(self.modulus);
        let k = usize::from(self.modulus);
        match self.conversion {
            Conversion::BytesToSymbols => (bytes, symbols),
            Conversion::SymbolsToBytes => (symbols, bytes),
            Conversion::BitsToSymbols => (k, 1),
            Conversion::SymbolsToBits => (1, k),
        }
    }

    fn convert(&self, input: &[u8]) -> Result<Vec<u8>, SymbolError> {
        match self.conversion {
            Conversion::BytesToSymbols => bytes_to_symbols(self.modulus, self.order, input),
            Conversion::SymbolsToBytes => symbols_to_bytes(self.modulus, self.order, input),
            Conversion::BitsToSymbols => bits_to_symbols(self.modulus, self.order, input),
            Conversion::SymbolsToBits => symbols_to_bits(self.modulus, self.order, input),
        }
    }

    fn rescale(&self, label: &Label) -> Label {
        let (unit_in, unit_out) = self.ratio();
        label.to_adjusted(unit_out as u64, unit_in as u64)
    }

    fn convert_packet(&self, packet: &Packet) -> Result<Packet, BlockError> {
        let (unit_in, _) = self.ratio();
        let bytes = packet.payload.as_bytes();
        let whole = bytes.len() / unit_in * unit_in;
        let converted = self.convert(&bytes[..whole])?;
        let payload = TypedChunk::from_elements(&converted)?;
        Ok(Packet {
            payload,
            labels: packet.labels.iter().map(|l| self.rescale(l)).collect(),
            metadata: packet.metadata.clone(),
        })
    }
}

impl Block for SymbolBlock {
    fn input_ports(&self) -> Vec<PortDecl> {
        vec![PortDecl::stream("0", DType::of::<u8>())]
    }

    fn output_ports(&self) -> Vec<PortDecl> {
        vec![PortDecl::stream("0", DType::of::<u8>())]
    }

    fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<(), BlockError> {
        let (unit_in, unit_out) = self.ratio();
        let (input, output) = (&mut ctx.inputs[0], &mut ctx.outputs[0]);
        input.set_reserve(unit_in);

        while let Some(message) = input.pop_message() {
            match message {
                Message::Packet(packet) => output.post_message(self.convert_packet(&packet)?),
                other => output.post_message(other),
            }
        }

        let steps = (input.elements() / unit_in).min(output.elements() / unit_out);
        if steps == 0 {
            return Ok(());
        }
        let converted = self.convert(&input.buffer().as_bytes()[..steps * unit_in])?;
        output.as_bytes_mut()[..converted.len()].copy_from_slice(&converted);
        input.consume(steps * unit_in);
        output.produce(steps * unit_out);
        Ok(())
    }

    fn propagate_labels(&mut self, _input: &InputPort, labels: &[Label], outputs: &mut [OutputPort]) -> Result<(), BlockError> {
        for label in labels {
            outputs[0].post_label(self.rescale(label));
        }
        Ok(())
    }
}

/// Register the four symbol blocks; each takes `[modulus, order?]`.
pub fn register(registry: &mut BlockRegistry) {
    for conversion in [
        Conversion::BytesToSymbols,
        Conversion::SymbolsToBytes,
        Conversion::BitsToSymbols,
        Conversion::SymbolsToBits,
    ] {
        registry.insert(
            conversion.path(),
            BlockFactory::variadic(move |args| Ok(Box::new(SymbolBlock::from_args(conversion, args)?) as Box<dyn Block>)),
        );
    }
}
