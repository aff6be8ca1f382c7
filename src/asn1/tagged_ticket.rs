use super::encrypted_data::EncryptedData;
use super::principal_name::PrincipalName;
use super::Realm;
use der::{Decode, DecodeValue, Encode, EncodeValue, FixedTag, Sequence, Tag, TagNumber};

/// ```text
/// Ticket          ::= [APPLICATION 1] SEQUENCE {
///         tkt-vno         [0] INTEGER (5),
///         realm           [1] Realm,
///         sname           [2] PrincipalName,
///         enc-part        [3] EncryptedData -- EncTicketPart
/// }
/// ````
#[derive(Debug, Eq, PartialEq, Sequence)]
pub(crate) struct Ticket {
    #[asn1(context_specific = "0")]
    pub(crate) tkt_vno: i8,
    #[asn1(context_specific = "1")]
    pub(crate) realm: Realm,
    #[asn1(context_specific = "2")]
    pub(crate) sname: PrincipalName,
    #[asn1(context_specific = "3")]
    pub(crate) enc_part: EncryptedData,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) struct TaggedTicket(pub(crate) Ticket);

impl TaggedTicket {
    pub(crate) fn realm(&self) -> &str {
        self.0.realm.as_ref()
    }
}

impl FixedTag for TaggedTicket {
    const TAG: Tag = Tag::Application {
        constructed: true,
        number: TagNumber(1),
    };
}

impl<'a> DecodeValue<'a> for TaggedTicket {
    type Error = der::Error;

    fn decode_value<R: der::Reader<'a>>(reader: &mut R, _header: der::Header) -> der::Result<Self> {
        let t: Ticket = Ticket::decode(reader)?;
        Ok(Self(t))
    }
}

impl EncodeValue for TaggedTicket {
    fn value_len(&self) -> der::Result<der::Length> {
        self.0.encoded_len()
    }
    fn encode_value(&self, encoder: &mut impl der::Writer) -> der::Result<()> {
        self.0.encode(encoder)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::asn1::kerberos_string::KerberosString;
    use der::asn1::OctetString;
    use std::str::FromStr;

    /// Build a DER ticket for the given service. The cipher text is filler, nothing
    /// in this crate decrypts tickets.
    pub(crate) fn encode_ticket(service: &[&str], realm: &str, kvno: u32) -> Vec<u8> {
        let ticket = Ticket {
            tkt_vno: 5,
            realm: KerberosString::from_str(realm).expect("realm"),
            sname: PrincipalName {
                name_type: 2,
                name_string: service
                    .iter()
                    .map(|c| KerberosString::from_str(c).expect("component"))
                    .collect(),
            },
            enc_part: EncryptedData {
                etype: 18,
                kvno: Some(kvno),
                cipher: OctetString::new(vec![0xa5; 64]).expect("cipher"),
            },
        };
        TaggedTicket(ticket).to_der().expect("encode")
    }

    #[test]
    fn test_ticket_decode() {
        let der_bytes = encode_ticket(&["afs", "example.org"], "EXAMPLE.ORG", 3);
        // [APPLICATION 1] constructed
        assert_eq!(der_bytes[0], 0x61);

        let tagged = TaggedTicket::from_der(&der_bytes).expect("decode");
        assert_eq!(tagged.realm(), "EXAMPLE.ORG");
        let sname: Vec<String> = tagged.0.sname.name_string.iter().map(|s| s.to_string()).collect();
        assert_eq!(sname, vec!["afs", "example.org"]);
        assert_eq!(tagged.0.enc_part.kvno, Some(3));
    }

    #[test]
    fn test_ticket_decode_garbage() {
        assert!(TaggedTicket::from_der(&[0x04, 0x02, 0x00, 0x01]).is_err());
    }
}
