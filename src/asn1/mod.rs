//! The handful of RFC 4120 types needed to look inside a service ticket.

pub(crate) mod encrypted_data;
pub(crate) mod kerberos_string;
pub(crate) mod principal_name;
pub(crate) mod tagged_ticket;

/// ```text
/// Realm           ::= KerberosString
/// ````
pub(crate) type Realm = kerberos_string::KerberosString;
