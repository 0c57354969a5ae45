//! Fake signing.
//!
//! The platform's signature check reads only the leading byte of the SHA-1
//! digest of the signed region. Zeroing the RSA signature and brute forcing a
//! counter in the trailing brute-force field until the digest starts with a
//! zero byte therefore produces structures the console accepts.

use sha1::{Digest, Sha1};

use crate::error::{WdError, WdResult};
use crate::structs::{
    Ticket, Tmd, TICKET_BRUTE_FORCE_OFF, TICKET_SIG_OFF, TMD_BRUTE_FORCE_OFF, TMD_SIG_OFF,
};

/// Marker written into `sig_padding` and `fake_sign` of scrubbed plaintext
/// partitions.
pub const NOT_ENCRYPTED_MARKER: &[u8] = b"*** partition is not encrypted ***";

fn copy_marker(dest: &mut [u8]) {
    dest.fill(0);
    let n = NOT_ENCRYPTED_MARKER.len().min(dest.len() - 1);
    dest[..n].copy_from_slice(&NOT_ENCRYPTED_MARKER[..n]);
}

fn has_marker(field: &[u8]) -> bool {
    field.len() > NOT_ENCRYPTED_MARKER.len()
        && &field[..NOT_ENCRYPTED_MARKER.len()] == NOT_ENCRYPTED_MARKER
}

/// Iterate a 32-bit counter in the brute-force field until the SHA-1 of
/// `buf[sig_off..]` has a leading zero byte. Returns the iteration count.
fn brute_force(buf: &mut [u8], sig_off: usize, bf_off: usize) -> WdResult<u32> {
    let mut hasher = Sha1::new();
    let mut val: u32 = 0;
    loop {
        buf[bf_off..bf_off + 4].copy_from_slice(&val.to_le_bytes());
        hasher.update(&buf[sig_off..]);
        let hash = hasher.finalize_reset();
        if hash[0] == 0 {
            return Ok(val.wrapping_add(1));
        }
        if val % 0x10000 == 0xFFFF {
            crate::check_interrupt()?;
        }
        match val.checked_add(1) {
            Some(next) => val = next,
            None => return Err(WdError::Fatal("fake sign search exhausted".into())),
        }
    }
}

fn leading_hash_byte(bytes: &[u8], sig_off: usize) -> u8 {
    let mut hasher = Sha1::new();
    hasher.update(&bytes[sig_off..]);
    hasher.finalize()[0]
}

pub fn ticket_clear_encryption(tik: &mut Ticket, mark_not_encrypted: bool) {
    tik.sig.fill(0);
    tik.sig_padding.fill(0);
    tik.fake_sign.fill(0);
    if mark_not_encrypted {
        copy_marker(&mut tik.sig_padding);
        copy_marker(&mut tik.fake_sign);
    }
}

pub fn ticket_is_marked_not_encrypted(tik: &Ticket) -> bool {
    has_marker(&tik.sig_padding) && has_marker(&tik.fake_sign)
}

/// Fake sign a ticket in place, returning the number of iterations spent.
pub fn ticket_fake_sign(tik: &mut Ticket) -> WdResult<u32> {
    ticket_clear_encryption(tik, false);
    let mut buf = tik.to_bytes()?;
    let count = brute_force(&mut buf, TICKET_SIG_OFF, TICKET_BRUTE_FORCE_OFF)?;
    *tik = Ticket::from_bytes(&buf)?;
    Ok(count)
}

pub fn ticket_is_fake_signed(tik: &Ticket) -> bool {
    if tik.sig.iter().any(|&b| b != 0) {
        return false;
    }
    match tik.to_bytes() {
        Ok(bytes) => leading_hash_byte(&bytes, TICKET_SIG_OFF) == 0,
        Err(_) => false,
    }
}

pub fn tmd_clear_encryption(tmd: &mut Tmd, mark_not_encrypted: bool) {
    tmd.sig.fill(0);
    tmd.sig_padding.fill(0);
    tmd.fake_sign.fill(0);
    if mark_not_encrypted {
        copy_marker(&mut tmd.sig_padding);
        copy_marker(&mut tmd.fake_sign);
    }
}

pub fn tmd_is_marked_not_encrypted(tmd: &Tmd) -> bool {
    has_marker(&tmd.sig_padding) && has_marker(&tmd.fake_sign)
}

/// Fake sign a TMD (base struct plus all content records) in place.
pub fn tmd_fake_sign(tmd: &mut Tmd) -> WdResult<u32> {
    tmd_clear_encryption(tmd, false);
    let mut buf = tmd.to_bytes()?;
    let count = brute_force(&mut buf, TMD_SIG_OFF, TMD_BRUTE_FORCE_OFF)?;
    *tmd = Tmd::from_bytes(&buf)?;
    Ok(count)
}

pub fn tmd_is_fake_signed(tmd: &Tmd) -> bool {
    if tmd.sig.iter().any(|&b| b != 0) {
        return false;
    }
    match tmd.to_bytes() {
        Ok(bytes) => leading_hash_byte(&bytes, TMD_SIG_OFF) == 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::structs::TmdContent;

    #[test]
    fn ticket_fake_sign_property() {
        let mut tik = Ticket::default();
        tik.title_id.copy_from_slice(b"\0\x01\0\0RFNE");
        tik.title_key = [0x5A; 16];
        let count = ticket_fake_sign(&mut tik).unwrap();
        assert!(count >= 1);
        assert!(ticket_is_fake_signed(&tik));
        let bytes = tik.to_bytes().unwrap();
        assert_eq!(leading_hash_byte(&bytes, TICKET_SIG_OFF), 0);
    }

    #[test]
    fn tmd_fake_sign_property() {
        let mut tmd = Tmd::default();
        tmd.contents.push(TmdContent::default());
        tmd.title_id.copy_from_slice(b"\0\x01\0\0RFNE");
        let count = tmd_fake_sign(&mut tmd).unwrap();
        assert!(count >= 1);
        assert!(tmd_is_fake_signed(&tmd));
    }

    #[test]
    fn fake_sign_average_iterations() {
        // 1 byte of entropy in the check: the expected count is 256.
        let mut total = 0u64;
        let n = 1000u64;
        let mut tik = Ticket::default();
        for i in 0..n {
            tik.title_key = [(i & 0xFF) as u8; 16];
            tik.ticket_id = i.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_be_bytes();
            total += u64::from(ticket_fake_sign(&mut tik).unwrap());
        }
        assert!(total / n <= 512, "average {} too high", total / n);
    }

    #[test]
    fn not_encrypted_marker_round_trip() {
        let mut tik = Ticket::default();
        assert!(!ticket_is_marked_not_encrypted(&tik));
        ticket_clear_encryption(&mut tik, true);
        assert!(ticket_is_marked_not_encrypted(&tik));
        // marking kills any fake signature
        assert!(!ticket_is_fake_signed(&tik) || tik.fake_sign[0] != 0);
    }
}
