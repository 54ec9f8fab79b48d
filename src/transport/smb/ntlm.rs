//! NTLMv2 authentication wrapped in SPNEGO
//!
//! Only what an SMB2 session setup needs: the NEGOTIATE and AUTHENTICATE
//! messages, CHALLENGE parsing, and the session base key used for signing.
//! No key exchange is negotiated, so the exported session key is the session
//! base key.

use crate::error::{Result, TetherError};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// 1.3.6.1.5.5.2
const SPNEGO_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];

/// 1.3.6.1.4.1.311.2.2.10
const NTLMSSP_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

type HmacMd5 = Hmac<Md5>;

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|_| TetherError::unavailable("smb", "HMAC-MD5 key rejected"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(to_array(&mac.finalize().into_bytes()))
}

fn to_array(digest: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// MD4 of the UTF-16LE password
pub fn nt_hash(password: &str) -> [u8; 16] {
    to_array(&Md4::digest(utf16le(password)))
}

/// NTOWFv2: keyed on the NT hash over upper-cased user and the domain
pub fn ntowf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16]> {
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity])
}

/// Current time as a Windows FILETIME
fn filetime_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_unix.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + u64::from(since_unix.subsec_nanos() / 100)
}

/// Server CHALLENGE message
#[derive(Debug, Clone)]
pub struct NtlmChallenge {
    /// 8-byte server challenge
    pub server_challenge: [u8; 8],
    /// Flags the server agreed to
    pub flags: u32,
    /// AV pair list, echoed back inside the NTLMv2 blob
    pub target_info: Vec<u8>,
}

impl NtlmChallenge {
    /// Parse a CHALLENGE message
    pub fn parse(token: &[u8]) -> Result<Self> {
        let malformed = || TetherError::connection("smb", "malformed NTLM challenge");

        if token.len() < 48 || &token[..8] != SIGNATURE || read_u32(token, 8) != Some(2) {
            return Err(malformed());
        }

        let flags = read_u32(token, 20).ok_or_else(malformed)?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&token[24..32]);

        let info_len = read_u16(token, 40).ok_or_else(malformed)? as usize;
        let info_offset = read_u32(token, 44).ok_or_else(malformed)? as usize;
        let target_info = token
            .get(info_offset..info_offset + info_len)
            .ok_or_else(malformed)?
            .to_vec();

        Ok(Self {
            server_challenge,
            flags,
            target_info,
        })
    }

    /// Server timestamp from the AV pairs, if present
    pub fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut pos = 0;
        while pos + 4 <= info.len() {
            let id = read_u16(info, pos)?;
            let len = read_u16(info, pos + 2)? as usize;
            if id == AV_EOL {
                return None;
            }
            if id == AV_TIMESTAMP && len == 8 {
                let bytes = info.get(pos + 4..pos + 12)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                return Some(u64::from_le_bytes(raw));
            }
            pos += 4 + len;
        }
        None
    }
}

/// Responses computed for one challenge
#[derive(Debug, Clone)]
pub struct Ntlmv2Response {
    /// NTProofStr followed by the client blob
    pub nt_response: Vec<u8>,
    /// LMv2 response, zeroed when the server sent a timestamp
    pub lm_response: Vec<u8>,
    /// Key for SMB2 signing
    pub session_base_key: [u8; 16],
}

impl Ntlmv2Response {
    /// Compute the NTLMv2 responses from explicit inputs
    pub fn compute(
        response_key: &[u8; 16],
        server_challenge: &[u8; 8],
        client_challenge: &[u8; 8],
        timestamp: u64,
        target_info: &[u8],
        zero_lm: bool,
    ) -> Result<Self> {
        let mut blob = Vec::with_capacity(32 + target_info.len());
        blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
        blob.extend_from_slice(&[0u8; 4]);
        blob.extend_from_slice(&timestamp.to_le_bytes());
        blob.extend_from_slice(client_challenge);
        blob.extend_from_slice(&[0u8; 4]);
        blob.extend_from_slice(target_info);
        blob.extend_from_slice(&[0u8; 4]);

        let nt_proof = hmac_md5(response_key, &[server_challenge, &blob])?;
        let session_base_key = hmac_md5(response_key, &[&nt_proof])?;

        let mut nt_response = nt_proof.to_vec();
        nt_response.extend_from_slice(&blob);

        let lm_response = if zero_lm {
            vec![0u8; 24]
        } else {
            let mut lm = hmac_md5(response_key, &[server_challenge, client_challenge])?.to_vec();
            lm.extend_from_slice(client_challenge);
            lm
        };

        Ok(Self {
            nt_response,
            lm_response,
            session_base_key,
        })
    }
}

/// Account used for NTLM authentication
#[derive(Clone)]
pub struct NtlmCredentials {
    /// Account name
    pub user: String,
    /// Password
    pub password: String,
    /// Domain; empty for the server's own
    pub domain: String,
}

impl std::fmt::Debug for NtlmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmCredentials")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// NEGOTIATE message
pub fn negotiate_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    // Empty domain and workstation fields
    msg.extend_from_slice(&[0u8; 16]);
    msg
}

/// AUTHENTICATE message answering `challenge`; also returns the session key
pub fn authenticate_message(
    credentials: &NtlmCredentials,
    challenge: &NtlmChallenge,
) -> Result<(Vec<u8>, [u8; 16])> {
    let response_key = ntowf_v2(&credentials.password, &credentials.user, &credentials.domain)?;

    let mut client_challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut client_challenge);
    let server_time = challenge.timestamp();

    let response = Ntlmv2Response::compute(
        &response_key,
        &challenge.server_challenge,
        &client_challenge,
        server_time.unwrap_or_else(filetime_now),
        &challenge.target_info,
        server_time.is_some(),
    )?;

    let domain = utf16le(&credentials.domain);
    let user = utf16le(&credentials.user);
    let workstation: Vec<u8> = Vec::new();
    let session_key: Vec<u8> = Vec::new();
    let flags = CLIENT_FLAGS & (challenge.flags | NEGOTIATE_UNICODE);

    let payloads: [&[u8]; 6] = [
        &response.lm_response,
        &response.nt_response,
        &domain,
        &user,
        &workstation,
        &session_key,
    ];

    const HEADER_LEN: usize = 64;
    let mut msg = Vec::with_capacity(HEADER_LEN + payloads.iter().map(|p| p.len()).sum::<usize>());
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());

    let mut offset = HEADER_LEN;
    for payload in &payloads {
        let len = payload.len() as u16;
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += payload.len();
    }
    msg.extend_from_slice(&flags.to_le_bytes());

    for payload in &payloads {
        msg.extend_from_slice(payload);
    }

    Ok((msg, response.session_base_key))
}

/// DER length octets
fn der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    der_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

/// SPNEGO NegTokenInit offering NTLMSSP with `token` as the mechToken
pub fn spnego_init(token: &[u8]) -> Vec<u8> {
    let mech_types = der(0xa0, &der(0x30, &der(0x06, NTLMSSP_OID)));
    let mech_token = der(0xa2, &der(0x04, token));

    let mut body = mech_types;
    body.extend_from_slice(&mech_token);
    let neg_token_init = der(0xa0, &der(0x30, &body));

    let mut app = der(0x06, SPNEGO_OID);
    app.extend_from_slice(&neg_token_init);
    der(0x60, &app)
}

/// SPNEGO NegTokenResp carrying `token` as the responseToken
pub fn spnego_response(token: &[u8]) -> Vec<u8> {
    der(0xa1, &der(0x30, &der(0xa2, &der(0x04, token))))
}

/// Locate the NTLM message inside a SPNEGO blob
pub fn extract_ntlm(blob: &[u8]) -> Option<&[u8]> {
    blob.windows(SIGNATURE.len())
        .position(|w| w == SIGNATURE)
        .map(|pos| &blob[pos..])
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    /// AV pairs: NbDomainName "Domain", NbComputerName "Server", EOL
    fn sample_target_info() -> Vec<u8> {
        let mut info = Vec::new();
        for (id, value) in [(2u16, "Domain"), (1u16, "Server")] {
            let value = utf16le(value);
            info.extend_from_slice(&id.to_le_bytes());
            info.extend_from_slice(&(value.len() as u16).to_le_bytes());
            info.extend_from_slice(&value);
        }
        info.extend_from_slice(&[0u8; 4]);
        info
    }

    /// CHALLENGE message as a server would send it
    pub(crate) fn challenge_message(server_challenge: [u8; 8], target_info: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&2u32.to_le_bytes());
        // Empty target name at offset 48
        msg.extend_from_slice(&[0, 0, 0, 0]);
        msg.extend_from_slice(&48u32.to_le_bytes());
        msg.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        msg.extend_from_slice(&server_challenge);
        msg.extend_from_slice(&[0u8; 8]);
        let len = target_info.len() as u16;
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&48u32.to_le_bytes());
        msg.extend_from_slice(target_info);
        msg
    }

    #[test]
    fn test_nt_hash() {
        assert_eq!(nt_hash("Password").to_vec(), hex("a4f49c406510bdcab6824ee7c30fd852"));
    }

    #[test]
    fn test_ntowf_v2() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(key.to_vec(), hex("0c868a403bfd7a93a3001ef22ef02e3f"));
    }

    #[test]
    fn test_ntlmv2_known_answer() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        let server_challenge = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
        let client_challenge = [0xaa; 8];

        let response = Ntlmv2Response::compute(
            &key,
            &server_challenge,
            &client_challenge,
            0,
            &sample_target_info(),
            false,
        )
        .unwrap();

        assert_eq!(response.nt_response[..16].to_vec(), hex("68cd0ab851e51c96aabc927bebef6a1c"));
        assert_eq!(response.session_base_key.to_vec(), hex("8de40ccadbc14a82f15cb0ad0de95ca3"));
        assert_eq!(
            response.lm_response,
            hex("86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa")
        );
    }

    #[test]
    fn test_zero_lm_when_timestamp_present() {
        let key = ntowf_v2("pw", "u", "").unwrap();
        let response =
            Ntlmv2Response::compute(&key, &[1; 8], &[2; 8], 42, &[0, 0, 0, 0], true).unwrap();
        assert_eq!(response.lm_response, vec![0u8; 24]);
        // NTProofStr + fixed blob fields + target info + trailer
        assert_eq!(response.nt_response.len(), 16 + 28 + 4 + 4);
    }

    #[test]
    fn test_parse_challenge() {
        let info = sample_target_info();
        let msg = challenge_message([9; 8], &info);
        let challenge = NtlmChallenge::parse(&msg).unwrap();
        assert_eq!(challenge.server_challenge, [9; 8]);
        assert_eq!(challenge.target_info, info);
        assert_eq!(challenge.timestamp(), None);

        assert!(NtlmChallenge::parse(b"NTLMSSP\0short").is_err());
        let mut wrong_type = msg.clone();
        wrong_type[8] = 1;
        assert!(NtlmChallenge::parse(&wrong_type).is_err());
    }

    #[test]
    fn test_challenge_timestamp() {
        let mut info = Vec::new();
        info.extend_from_slice(&AV_TIMESTAMP.to_le_bytes());
        info.extend_from_slice(&8u16.to_le_bytes());
        info.extend_from_slice(&0x01d0_0000_0000_0000u64.to_le_bytes());
        info.extend_from_slice(&[0u8; 4]);
        let challenge = NtlmChallenge::parse(&challenge_message([0; 8], &info)).unwrap();
        assert_eq!(challenge.timestamp(), Some(0x01d0_0000_0000_0000));
    }

    #[test]
    fn test_authenticate_layout() {
        let credentials = NtlmCredentials {
            user: "alice".into(),
            password: "secret".into(),
            domain: "CORP".into(),
        };
        let message = challenge_message([7; 8], &sample_target_info());
        let challenge = NtlmChallenge::parse(&message).unwrap();
        let (msg, key) = authenticate_message(&credentials, &challenge).unwrap();

        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(read_u32(&msg, 8), Some(3));

        // Domain and user fields point at their UTF-16LE payloads
        let domain_len = read_u16(&msg, 28).unwrap() as usize;
        let domain_off = read_u32(&msg, 32).unwrap() as usize;
        assert_eq!(&msg[domain_off..domain_off + domain_len], utf16le("CORP").as_slice());
        let user_len = read_u16(&msg, 36).unwrap() as usize;
        let user_off = read_u32(&msg, 40).unwrap() as usize;
        assert_eq!(&msg[user_off..user_off + user_len], utf16le("alice").as_slice());

        assert_ne!(key, [0u8; 16]);
        assert!(!format!("{:?}", credentials).contains("secret"));
    }

    #[test]
    fn test_spnego_wrapping() {
        let token = negotiate_message();
        let init = spnego_init(&token);
        assert_eq!(init[0], 0x60);
        assert_eq!(init[1] as usize, init.len() - 2);
        assert!(init.windows(NTLMSSP_OID.len()).any(|w| w == NTLMSSP_OID));
        assert_eq!(extract_ntlm(&init), Some(token.as_slice()));

        let resp = spnego_response(b"NTLMSSP\0abc");
        assert_eq!(resp[0], 0xa1);
        assert_eq!(extract_ntlm(&resp), Some(&b"NTLMSSP\0abc"[..]));
        assert_eq!(extract_ntlm(b"nothing here"), None);
    }

    #[test]
    fn test_der_long_lengths() {
        let mut out = Vec::new();
        der_length(0x7f, &mut out);
        der_length(0x80, &mut out);
        der_length(0x1234, &mut out);
        assert_eq!(out, vec![0x7f, 0x81, 0x80, 0x82, 0x12, 0x34]);
    }
}
