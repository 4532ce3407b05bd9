//! Extended bind-error classification
//!
//! When a simple bind is rejected, Active Directory embeds a sub-code in
//! the diagnostic text: `... AcceptSecurityContext error, data 52e, ...`.
//! The sub-code distinguishes a wrong password from a disabled account, an
//! expired password, logon-time restrictions and so on. This module parses
//! the text and maps the code to a stable symbolic name the control surface
//! can present.

use adbridge_core::ports::ExtendedBindError;
use regex::Regex;

/// Known bind sub-codes
/// (see <http://ldapwiki.willeke.com/wiki/Common%20Active%20Directory%20Bind%20Errors>)
const KNOWN_CODES: &[(u32, &str, &str)] = &[
    (0x525, "user-not-found", "User does not exist"),
    (0x52e, "invalid-password", "Invalid password"),
    (0x52f, "account-restrictions", "Account restrictions are preventing signing in"),
    (0x530, "time-restrictions", "Logon time restriction violation"),
    (0x531, "computer-restrictions", "Not allowed to log on to this computer"),
    (0x532, "password-expired", "Password has expired"),
    (0x533, "account-disabled", "Account is disabled"),
    (0x568, "too-many-security-ids", "The user security context accumulated too many security IDs"),
    (0x701, "account-expired", "Account has expired"),
    (0x773, "password-must-change", "User password must be changed before logging on"),
    (0x775, "account-locked", "Account is locked out"),
];

/// Parses the extended sub-code out of a bind rejection's diagnostic text.
///
/// Returns `None` when the text doesn't carry an `AcceptSecurityContext`
/// data code (non-AD servers, or rejections without diagnostics).
pub fn parse_extended_bind_error(text: &str) -> Option<ExtendedBindError> {
    let re = Regex::new(r"AcceptSecurityContext error, data ([0-9A-Fa-f]+),").ok()?;
    let captures = re.captures(text)?;
    let code = u32::from_str_radix(&captures[1], 16).ok()?;

    let (symbolic, message) = KNOWN_CODES
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|(_, sym, msg)| (sym.to_string(), msg.to_string()))
        .unwrap_or_else(|| (format!("ad-error-{code:x}"), format!("Active Directory error: {code:#x}")));

    Some(ExtendedBindError {
        code,
        message,
        symbolic,
    })
}

/// Fallback detail for a rejected bind whose text carried no sub-code
pub fn generic_bind_error(text: &str) -> ExtendedBindError {
    ExtendedBindError {
        code: 0,
        message: if text.is_empty() {
            "Invalid credentials".to_string()
        } else {
            text.to_string()
        },
        symbolic: "invalid-credentials".to_string(),
    }
}
