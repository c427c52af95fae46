use crate::{
    namespace::{AmlName, NodeKind},
    object::{FieldFlags, Object, UpdateRule},
    AmlError,
    Handler,
    Interpreter,
};
use bit_field::BitField;
use log::trace;
use pci_types::PciAddress;

/// An operation region: a window onto memory, port IO, or PCI configuration space that field
/// units carve up into named bit ranges.
#[derive(Clone, Debug)]
pub struct OpRegion {
    pub space: RegionSpace,
    pub base: u64,
    pub length: u64,
    /// Scope the region was declared in. PCI config regions use this to find the parent
    /// device's `_SEG`/`_BBN`/`_ADR`.
    pub parent_scope: AmlName,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RegionSpace {
    SystemMemory,
    SystemIO,
    PciConfig,
    EmbeddedControl,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    Pcc,
    Oem(u8),
}

impl From<u8> for RegionSpace {
    fn from(value: u8) -> Self {
        match value {
            0 => RegionSpace::SystemMemory,
            1 => RegionSpace::SystemIO,
            2 => RegionSpace::PciConfig,
            3 => RegionSpace::EmbeddedControl,
            4 => RegionSpace::SmBus,
            5 => RegionSpace::SystemCmos,
            6 => RegionSpace::PciBarTarget,
            7 => RegionSpace::Ipmi,
            8 => RegionSpace::GeneralPurposeIo,
            9 => RegionSpace::GenericSerialBus,
            10 => RegionSpace::Pcc,
            _ => RegionSpace::Oem(value),
        }
    }
}

impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Read the field-like node at `path`. Fields and index-fields perform operation-region
    /// IO; buffer fields read out of the buffer bound to a `Name` node.
    pub(crate) fn read_field(&self, path: &AmlName) -> Result<Object, AmlError> {
        let node = self.namespace.lock().get(path)?.clone();
        match node.kind {
            NodeKind::Field { region, flags, bit_index, bit_length } => {
                let region = self.region_at(&region)?;
                let value = self.field_read(&region, flags, bit_index, bit_length)?;
                Ok(Object::Integer(value))
            }
            NodeKind::IndexField { index, data, flags, bit_index, bit_length } => {
                let value = self.index_field_access(&index, &data, flags, bit_index, bit_length, None)?;
                Ok(Object::Integer(value))
            }
            NodeKind::BufferField { buffer, byte_index, byte_length } => {
                let namespace = self.namespace.lock();
                let bytes = namespace.read_name(&buffer)?;
                let bytes = bytes.as_buffer()?;
                if byte_index + byte_length > bytes.len() {
                    return Err(AmlError::IndexOutOfBounds);
                }
                let mut value = [0; 8];
                value[..byte_length].copy_from_slice(&bytes[byte_index..byte_index + byte_length]);
                Ok(Object::Integer(u64::from_le_bytes(value)))
            }
            other => Err(AmlError::UnexpectedNodeType { path: path.clone(), type_name: other.type_name() }),
        }
    }

    pub(crate) fn write_field(&self, path: &AmlName, value: u64) -> Result<(), AmlError> {
        let node = self.namespace.lock().get(path)?.clone();
        match node.kind {
            NodeKind::Field { region, flags, bit_index, bit_length } => {
                let region = self.region_at(&region)?;
                self.field_write(&region, flags, bit_index, bit_length, value)
            }
            NodeKind::IndexField { index, data, flags, bit_index, bit_length } => {
                self.index_field_access(&index, &data, flags, bit_index, bit_length, Some(value))?;
                Ok(())
            }
            NodeKind::BufferField { buffer, byte_index, byte_length } => {
                let mut namespace = self.namespace.lock();
                let node = namespace.get_mut(&buffer)?;
                let NodeKind::Name(Object::Buffer(bytes)) = &mut node.kind else {
                    return Err(AmlError::UnexpectedNodeType {
                        path: buffer.clone(),
                        type_name: node.kind.type_name(),
                    });
                };
                if byte_index + byte_length > bytes.len() {
                    return Err(AmlError::IndexOutOfBounds);
                }
                bytes[byte_index..byte_index + byte_length].copy_from_slice(&value.to_le_bytes()[..byte_length]);
                Ok(())
            }
            other => Err(AmlError::UnexpectedNodeType { path: path.clone(), type_name: other.type_name() }),
        }
    }

    fn region_at(&self, path: &AmlName) -> Result<OpRegion, AmlError> {
        let namespace = self.namespace.lock();
        let node = namespace.get(path)?;
        match &node.kind {
            NodeKind::OpRegion(region) => Ok(region.clone()),
            other => Err(AmlError::UnexpectedNodeType { path: path.clone(), type_name: other.type_name() }),
        }
    }

    /// Read a field unit out of `region` by performing access-width-aligned native accesses
    /// and shifting/masking the covered bit range out of them.
    fn field_read(
        &self,
        region: &OpRegion,
        flags: FieldFlags,
        bit_index: usize,
        bit_length: usize,
    ) -> Result<u64, AmlError> {
        if bit_length > 64 {
            return Err(AmlError::FieldTooWide(bit_length));
        }
        let access_bits = flags.access_width_bytes()? * 8;
        trace!(
            "field read: region space {:?}, bit index {}, bit length {}, access width {}",
            region.space,
            bit_index,
            bit_length,
            access_bits
        );

        let lead_bit = bit_index % access_bits;
        let aligned_byte = (bit_index - lead_bit) / 8;
        let accesses = (lead_bit + bit_length).div_ceil(access_bits);

        // A <=64-bit field can straddle at most 128 bits of aligned accesses.
        let mut window: u128 = 0;
        for i in 0..accesses {
            let raw = self.region_read(region, aligned_byte + i * (access_bits / 8), access_bits / 8)?;
            window |= (raw as u128) << (i * access_bits);
        }

        let value = (window >> lead_bit) as u64;
        Ok(if bit_length < 64 { value.get_bits(0..bit_length) } else { value })
    }

    fn field_write(
        &self,
        region: &OpRegion,
        flags: FieldFlags,
        bit_index: usize,
        bit_length: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        if bit_length > 64 {
            return Err(AmlError::FieldTooWide(bit_length));
        }
        let access_bits = flags.access_width_bytes()? * 8;
        let lead_bit = bit_index % access_bits;
        let aligned_byte = (bit_index - lead_bit) / 8;
        let accesses = (lead_bit + bit_length).div_ceil(access_bits);

        let mut window: u128 = match flags.update_rule() {
            UpdateRule::Preserve => {
                let mut window = 0;
                for i in 0..accesses {
                    let raw =
                        self.region_read(region, aligned_byte + i * (access_bits / 8), access_bits / 8)?;
                    window |= (raw as u128) << (i * access_bits);
                }
                window
            }
            UpdateRule::WriteAsOnes => u128::MAX,
            UpdateRule::WriteAsZeros => 0,
        };

        let mask = ((1u128 << bit_length) - 1) << lead_bit;
        window = (window & !mask) | (((value as u128) << lead_bit) & mask);

        for i in 0..accesses {
            let chunk = (window >> (i * access_bits)) as u64;
            let chunk = if access_bits < 64 { chunk.get_bits(0..access_bits) } else { chunk };
            self.region_write(region, aligned_byte + i * (access_bits / 8), access_bits / 8, chunk)?;
        }
        Ok(())
    }

    /// An index-field access writes the byte offset of the access into the index field, then
    /// transfers through the data field. `value` selects between read (`None`) and write.
    fn index_field_access(
        &self,
        index: &AmlName,
        data: &AmlName,
        flags: FieldFlags,
        bit_index: usize,
        bit_length: usize,
        value: Option<u64>,
    ) -> Result<u64, AmlError> {
        if bit_length > 64 {
            return Err(AmlError::FieldTooWide(bit_length));
        }
        let access_bits = flags.access_width_bytes()? * 8;
        let lead_bit = bit_index % access_bits;
        if lead_bit + bit_length > access_bits {
            // Transfers wider than the data register would need a read-modify-write dance per
            // chunk; firmware in the wild keeps index fields register-sized.
            return Err(AmlError::FieldTooWide(bit_length));
        }

        self.write_field(index, (bit_index / access_bits * (access_bits / 8)) as u64)?;
        match value {
            Some(value) => {
                let current = match flags.update_rule() {
                    UpdateRule::Preserve => self.read_field(data)?.as_integer()?,
                    UpdateRule::WriteAsOnes => u64::MAX,
                    UpdateRule::WriteAsZeros => 0,
                };
                let mut merged = current;
                merged.set_bits(lead_bit..lead_bit + bit_length, value.get_bits(0..bit_length));
                self.write_field(data, merged)?;
                Ok(0)
            }
            None => {
                let raw = self.read_field(data)?.as_integer()?;
                Ok(raw.get_bits(lead_bit..lead_bit + bit_length))
            }
        }
    }

    fn region_read(&self, region: &OpRegion, byte_offset: usize, width_bytes: usize) -> Result<u64, AmlError> {
        self.check_region_bounds(region, byte_offset, width_bytes)?;
        match region.space {
            RegionSpace::SystemMemory => {
                let address = region.base as usize + byte_offset;
                Ok(match width_bytes {
                    1 => self.handler.read_u8(address) as u64,
                    2 => self.handler.read_u16(address) as u64,
                    4 => self.handler.read_u32(address) as u64,
                    8 => self.handler.read_u64(address),
                    _ => unreachable!(),
                })
            }
            RegionSpace::SystemIO => {
                let port = region.base as u16 + byte_offset as u16;
                Ok(match width_bytes {
                    1 => self.handler.read_io_u8(port) as u64,
                    2 => self.handler.read_io_u16(port) as u64,
                    4 => self.handler.read_io_u32(port) as u64,
                    _ => return Err(AmlError::FieldTooWide(width_bytes * 8)),
                })
            }
            RegionSpace::PciConfig => {
                let address = self.pci_address_for(region)?;
                let offset = (region.base as usize + byte_offset) as u16;
                Ok(match width_bytes {
                    1 => self.handler.read_pci_u8(address, offset) as u64,
                    2 => self.handler.read_pci_u16(address, offset) as u64,
                    4 => self.handler.read_pci_u32(address, offset) as u64,
                    _ => return Err(AmlError::FieldTooWide(width_bytes * 8)),
                })
            }
            space => Err(AmlError::UnsupportedRegionSpace(space)),
        }
    }

    fn region_write(
        &self,
        region: &OpRegion,
        byte_offset: usize,
        width_bytes: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        self.check_region_bounds(region, byte_offset, width_bytes)?;
        match region.space {
            RegionSpace::SystemMemory => {
                let address = region.base as usize + byte_offset;
                match width_bytes {
                    1 => self.handler.write_u8(address, value as u8),
                    2 => self.handler.write_u16(address, value as u16),
                    4 => self.handler.write_u32(address, value as u32),
                    8 => self.handler.write_u64(address, value),
                    _ => unreachable!(),
                }
                Ok(())
            }
            RegionSpace::SystemIO => {
                let port = region.base as u16 + byte_offset as u16;
                match width_bytes {
                    1 => self.handler.write_io_u8(port, value as u8),
                    2 => self.handler.write_io_u16(port, value as u16),
                    4 => self.handler.write_io_u32(port, value as u32),
                    _ => return Err(AmlError::FieldTooWide(width_bytes * 8)),
                }
                Ok(())
            }
            RegionSpace::PciConfig => {
                let address = self.pci_address_for(region)?;
                let offset = (region.base as usize + byte_offset) as u16;
                match width_bytes {
                    1 => self.handler.write_pci_u8(address, offset, value as u8),
                    2 => self.handler.write_pci_u16(address, offset, value as u16),
                    4 => self.handler.write_pci_u32(address, offset, value as u32),
                    _ => return Err(AmlError::FieldTooWide(width_bytes * 8)),
                }
                Ok(())
            }
            space => Err(AmlError::UnsupportedRegionSpace(space)),
        }
    }

    fn check_region_bounds(
        &self,
        region: &OpRegion,
        byte_offset: usize,
        width_bytes: usize,
    ) -> Result<(), AmlError> {
        // PCI config regions are offsets within a function's config space, checked against the
        // region length only.
        if (byte_offset + width_bytes) as u64 > region.length {
            return Err(AmlError::IndexOutOfBounds);
        }
        Ok(())
    }

    /// Form the PCI address of the device a config-space region belongs to by evaluating the
    /// `_SEG`, `_BBN`, and `_ADR` objects in the region's scope. Absent objects default to 0.
    fn pci_address_for(&self, region: &OpRegion) -> Result<PciAddress, AmlError> {
        let evaluate = |name: &str| -> Result<u64, AmlError> {
            let path = AmlName::from_str(name).unwrap().resolve(&region.parent_scope)?;
            match self.invoke_path_if_present(path, alloc::vec::Vec::new())? {
                Some(value) => value.as_integer(),
                None => Ok(0),
            }
        };

        let segment = evaluate("_SEG")?;
        let bus = evaluate("_BBN")?;
        let adr = evaluate("_ADR")?;
        let (device, function) = (adr.get_bits(16..32), adr.get_bits(0..16));
        Ok(PciAddress::new(segment as u16, bus as u8, device as u8, function as u8))
    }
}
