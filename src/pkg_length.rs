use crate::AmlError;
use bit_field::BitField;

/// Decode a PkgLength at the start of `bytes`. Returns the encoded length and the number of
/// bytes the encoding itself occupied.
///
/// The top two bits of the lead byte give the number of follow-on bytes. With no follow-on
/// bytes the low 6 bits are the whole length; otherwise the lead byte contributes only its low
/// 4 bits and each follow-on byte supplies 8 more, little-endian. Note that the encoded length
/// includes the bytes of the PkgLength itself.
pub fn parse_pkg_length(bytes: &[u8]) -> Result<(usize, usize), AmlError> {
    let lead_byte = *bytes.first().ok_or(AmlError::RunOutOfStream)?;
    let byte_count = lead_byte.get_bits(6..8) as usize;

    if byte_count == 0 {
        return Ok((lead_byte.get_bits(0..6) as usize, 1));
    }

    if bytes.len() < 1 + byte_count {
        return Err(AmlError::RunOutOfStream);
    }

    let mut length = lead_byte.get_bits(0..4) as usize;
    for i in 0..byte_count {
        length |= (bytes[1 + i] as usize) << (4 + i * 8);
    }

    Ok((length, 1 + byte_count))
}
