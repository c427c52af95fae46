//! Populates the namespace from the declarative constructs of a DSDT/SSDT term list. The
//! execution engine only ever runs method bodies; everything at table scope is a definition
//! and lands here.

use crate::{
    namespace::{parse_name_string, AmlName, NameSeg, NodeKind},
    object::FieldFlags,
    op_region::{OpRegion, RegionSpace},
    opcode,
    pkg_length::parse_pkg_length,
    AmlError,
    Handler,
    Interpreter,
    MethodState,
};
use alloc::vec::Vec;
use log::{debug, info};

impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Walk a table's definition block and populate the namespace with everything it
    /// declares. `stream` is the AML byte stream, without the table header.
    pub fn load_table(&self, stream: &[u8]) -> Result<(), AmlError> {
        info!("loading AML definition block ({} bytes)", stream.len());
        self.load_term_list(stream, &AmlName::root())
    }

    fn load_term_list(&self, bytes: &[u8], scope: &AmlName) -> Result<(), AmlError> {
        let mut pc = 0;
        while pc < bytes.len() {
            pc += self.load_term(&bytes[pc..], scope)?;
        }
        Ok(())
    }

    fn load_term(&self, bytes: &[u8], scope: &AmlName) -> Result<usize, AmlError> {
        match bytes[0] {
            opcode::SCOPE_OP => {
                let mut pc = 1;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;

                let new_scope = name.resolve(scope)?;
                // Scopes re-open existing locations, so a collision is not an error here.
                match self.namespace.lock().insert(new_scope.clone(), NodeKind::Scope) {
                    Ok(()) | Err(AmlError::NameCollision(_)) => (),
                    Err(other) => return Err(other),
                }
                self.load_term_list(bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?, &new_scope)?;
                Ok(end)
            }

            opcode::NAME_OP => {
                let mut scratch = MethodState::new(scope.clone());
                self.exec_name(&mut scratch, bytes)
            }

            opcode::METHOD_OP => {
                let mut pc = 1;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let flags = crate::object::MethodFlags(*bytes.get(pc).ok_or(AmlError::RunOutOfStream)?);
                pc += 1;

                let code = bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?.to_vec();
                self.namespace.lock().insert(name.resolve(scope)?, NodeKind::Method { code, flags })?;
                Ok(end)
            }

            opcode::ALIAS_OP => {
                let mut pc = 1;
                let (source, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let (alias, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;

                let mut namespace = self.namespace.lock();
                let source = namespace.search(&source, scope)?;
                let kind = namespace.get(&source)?.kind.clone();
                namespace.insert(alias.resolve(scope)?, kind)?;
                Ok(pc)
            }

            opcode::EXT_OPCODE_PREFIX => {
                self.load_extended_term(bytes, scope, *bytes.get(1).ok_or(AmlError::RunOutOfStream)?)
            }

            other => Err(AmlError::IllegalOpcode(other as u16)),
        }
    }

    fn load_extended_term(&self, bytes: &[u8], scope: &AmlName, ext: u8) -> Result<usize, AmlError> {
        match ext {
            opcode::MUTEX_OP => {
                let mut pc = 2;
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let sync_level = *bytes.get(pc).ok_or(AmlError::RunOutOfStream)?;
                pc += 1;

                self.namespace.lock().insert(name.resolve(scope)?, NodeKind::Mutex { sync_level })?;
                Ok(pc)
            }

            opcode::OP_REGION_OP => {
                let mut pc = 2;
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let space = RegionSpace::from(*bytes.get(pc).ok_or(AmlError::RunOutOfStream)?);
                pc += 1;

                let mut scratch = MethodState::new(scope.clone());
                let (base, consumed) = self.eval_object(&mut scratch, &bytes[pc..])?;
                pc += consumed;
                let (length, consumed) = self.eval_object(&mut scratch, &bytes[pc..])?;
                pc += consumed;

                let region = OpRegion {
                    space,
                    base: base.as_integer()?,
                    length: length.as_integer()?,
                    parent_scope: scope.clone(),
                };
                self.namespace.lock().insert(name.resolve(scope)?, NodeKind::OpRegion(region))?;
                Ok(pc)
            }

            opcode::FIELD_OP => {
                let mut pc = 2;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;
                let (region_name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let flags = FieldFlags(*bytes.get(pc).ok_or(AmlError::RunOutOfStream)?);
                pc += 1;

                let region = self.namespace.lock().search(&region_name, scope)?;
                let elements = parse_field_elements(bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?)?;
                let mut namespace = self.namespace.lock();
                for (seg, bit_index, bit_length) in elements {
                    namespace.insert(
                        AmlName::from_name_seg(seg).resolve(scope)?,
                        NodeKind::Field { region: region.clone(), flags, bit_index, bit_length },
                    )?;
                }
                Ok(end)
            }

            opcode::INDEX_FIELD_OP => {
                let mut pc = 2;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;
                let (index_name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let (data_name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;
                let flags = FieldFlags(*bytes.get(pc).ok_or(AmlError::RunOutOfStream)?);
                pc += 1;

                let (index, data) = {
                    let namespace = self.namespace.lock();
                    (namespace.search(&index_name, scope)?, namespace.search(&data_name, scope)?)
                };
                let elements = parse_field_elements(bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?)?;
                let mut namespace = self.namespace.lock();
                for (seg, bit_index, bit_length) in elements {
                    namespace.insert(
                        AmlName::from_name_seg(seg).resolve(scope)?,
                        NodeKind::IndexField {
                            index: index.clone(),
                            data: data.clone(),
                            flags,
                            bit_index,
                            bit_length,
                        },
                    )?;
                }
                Ok(end)
            }

            opcode::DEVICE_OP => {
                let mut pc = 2;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;

                let new_scope = name.resolve(scope)?;
                self.namespace.lock().insert(new_scope.clone(), NodeKind::Device)?;
                self.load_term_list(bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?, &new_scope)?;
                Ok(end)
            }

            opcode::PROCESSOR_OP => {
                let mut pc = 2;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                pc += consumed;

                let tail = bytes.get(pc..pc + 6).ok_or(AmlError::RunOutOfStream)?;
                let proc_id = tail[0];
                let pblk_address = u32::from_le_bytes([tail[1], tail[2], tail[3], tail[4]]);
                let pblk_length = tail[5];
                pc += 6;

                let new_scope = name.resolve(scope)?;
                self.namespace
                    .lock()
                    .insert(new_scope.clone(), NodeKind::Processor { proc_id, pblk_address, pblk_length })?;
                self.load_term_list(bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?, &new_scope)?;
                Ok(end)
            }

            other => Err(AmlError::IllegalOpcode(opcode::ext(other))),
        }
    }
}

/// Walk a FieldList, tracking the running bit offset. Returns `(name, bit_index, bit_length)`
/// for each named element.
fn parse_field_elements(bytes: &[u8]) -> Result<Vec<(NameSeg, usize, usize)>, AmlError> {
    const RESERVED_FIELD: u8 = 0x00;
    const ACCESS_FIELD: u8 = 0x01;

    let mut fields = Vec::new();
    let mut pc = 0;
    let mut bit_index = 0;

    while pc < bytes.len() {
        match bytes[pc] {
            RESERVED_FIELD => {
                pc += 1;
                let (length, consumed) = parse_pkg_length(&bytes[pc..])?;
                pc += consumed;
                bit_index += length;
            }
            ACCESS_FIELD => {
                // AccessType + AccessAttrib. The declared access width is taken from the
                // field flags instead.
                debug!("ignoring AccessField in field list");
                pc += 3;
            }
            _ => {
                let seg = bytes.get(pc..pc + 4).ok_or(AmlError::RunOutOfStream)?;
                let seg = NameSeg::from_bytes([seg[0], seg[1], seg[2], seg[3]])?;
                pc += 4;
                let (length, consumed) = parse_pkg_length(&bytes[pc..])?;
                pc += consumed;
                fields.push((seg, bit_index, length));
                bit_index += length;
            }
        }
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_list_offsets() {
        // Offset(1), FLD0 at 8 bits for 8, FLD1 for 16
        let list = [
            0x00, 0x08, // reserved, 8 bits
            b'F', b'L', b'D', b'0', 0x08,
            b'F', b'L', b'D', b'1', 0x10,
        ];
        let elements = parse_field_elements(&list).unwrap();
        assert_eq!(
            elements,
            alloc::vec![
                (NameSeg(*b"FLD0"), 8, 8),
                (NameSeg(*b"FLD1"), 16, 16),
            ]
        );
    }
}
