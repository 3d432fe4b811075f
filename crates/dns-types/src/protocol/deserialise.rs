//! Deserialisation of DNS messages from the wire format.  See the
//! `types` module for details of the format, and `serialise` for the
//! inverse operation.

use bytes::Bytes;

use crate::protocol::types::*;

/// Maximum number of compression pointer hops to follow before giving
/// up - this bounds the work done parsing a maliciously-crafted
/// message, since every pointer must point strictly backward in the
/// buffer.
const MAX_POINTER_HOPS: usize = 128;

impl Message {
    /// # Errors
    ///
    /// If the octets are not a well-formed DNS message.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        let mut buffer = ReadableBuffer::new(octets);
        Self::deserialise(&mut buffer)
    }

    fn deserialise(buffer: &mut ReadableBuffer) -> Result<Self, Error> {
        let header = Header::deserialise(buffer)?;
        let qdcount = buffer.read_u16()?;
        let ancount = buffer.read_u16()?;
        let nscount = buffer.read_u16()?;
        let arcount = buffer.read_u16()?;

        let with_id = |err: ErrorKind| Error { id: Some(header.id), kind: err };

        let mut questions = Vec::with_capacity(qdcount.into());
        for _ in 0..qdcount {
            questions.push(Question::deserialise(buffer).map_err(|e| with_id(e.kind))?);
        }

        let mut answers = Vec::with_capacity(ancount.into());
        for _ in 0..ancount {
            answers.push(ResourceRecord::deserialise(buffer).map_err(|e| with_id(e.kind))?);
        }

        let mut authority = Vec::with_capacity(nscount.into());
        for _ in 0..nscount {
            authority.push(ResourceRecord::deserialise(buffer).map_err(|e| with_id(e.kind))?);
        }

        let mut additional = Vec::with_capacity(arcount.into());
        for _ in 0..arcount {
            additional.push(ResourceRecord::deserialise(buffer).map_err(|e| with_id(e.kind))?);
        }

        Ok(Message {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl Header {
    fn deserialise(buffer: &mut ReadableBuffer) -> Result<Self, Error> {
        let id = buffer.read_u16().map_err(|_| Error {
            id: None,
            kind: ErrorKind::TooShort,
        })?;
        let with_id = |err: ErrorKind| Error { id: Some(id), kind: err };

        let octet1 = buffer.read_u8().map_err(|e| with_id(e.kind))?;
        let octet2 = buffer.read_u8().map_err(|e| with_id(e.kind))?;

        let is_response = octet1 & HEADER_MASK_QR != 0;
        let opcode = Opcode::from((octet1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE);
        let is_authoritative = octet1 & HEADER_MASK_AA != 0;
        let is_truncated = octet1 & HEADER_MASK_TC != 0;
        let recursion_desired = octet1 & HEADER_MASK_RD != 0;
        let recursion_available = octet2 & HEADER_MASK_RA != 0;
        let rcode = Rcode::from((octet2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE);

        Ok(Header {
            id,
            is_response,
            opcode,
            is_authoritative,
            is_truncated,
            recursion_desired,
            recursion_available,
            rcode,
        })
    }
}

impl Question {
    fn deserialise(buffer: &mut ReadableBuffer) -> Result<Self, Error> {
        let name = buffer.read_name()?;
        let qtype = QueryType::from(buffer.read_u16()?);
        let qclass = QueryClass::from(buffer.read_u16()?);

        Ok(Question { name, qtype, qclass })
    }
}

impl ResourceRecord {
    fn deserialise(buffer: &mut ReadableBuffer) -> Result<Self, Error> {
        let name = buffer.read_name()?;
        let rtype = RecordType::from(buffer.read_u16()?);
        let rclass = RecordClass::from(buffer.read_u16()?);
        let ttl = buffer.read_u32()?;
        let rdlength = buffer.read_u16()?;

        let rdata_start = buffer.pos;
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: buffer.read_ipv4()?,
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: buffer.read_name()?,
            },
            RecordType::MD => RecordTypeWithData::MD {
                madname: buffer.read_name()?,
            },
            RecordType::MF => RecordTypeWithData::MF {
                madname: buffer.read_name()?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: buffer.read_name()?,
            },
            RecordType::SOA => {
                let mname = buffer.read_name()?;
                let rname = buffer.read_name()?;
                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;
                RecordTypeWithData::SOA {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                }
            }
            RecordType::MB => RecordTypeWithData::MB {
                madname: buffer.read_name()?,
            },
            RecordType::MG => RecordTypeWithData::MG {
                mdmname: buffer.read_name()?,
            },
            RecordType::MR => RecordTypeWithData::MR {
                newname: buffer.read_name()?,
            },
            RecordType::NULL => RecordTypeWithData::NULL {
                octets: buffer.read_octets(rdlength.into())?,
            },
            RecordType::WKS => RecordTypeWithData::WKS {
                octets: buffer.read_octets(rdlength.into())?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: buffer.read_name()?,
            },
            RecordType::HINFO => RecordTypeWithData::HINFO {
                octets: buffer.read_octets(rdlength.into())?,
            },
            RecordType::MINFO => {
                let rmailbx = buffer.read_name()?;
                let emailbx = buffer.read_name()?;
                RecordTypeWithData::MINFO { rmailbx, emailbx }
            }
            RecordType::MX => {
                let preference = buffer.read_u16()?;
                let exchange = buffer.read_name()?;
                RecordTypeWithData::MX {
                    preference,
                    exchange,
                }
            }
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: buffer.read_octets(rdlength.into())?,
            },
            RecordType::AAAA => RecordTypeWithData::AAAA {
                address: buffer.read_ipv6()?,
            },
            RecordType::SRV => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;
                let target = buffer.read_name()?;
                RecordTypeWithData::SRV {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::TLSA => {
                let cert_usage = buffer.read_u8()?;
                let selector = buffer.read_u8()?;
                let matching_type = buffer.read_u8()?;
                let remaining = (rdata_start + usize::from(rdlength)).saturating_sub(buffer.pos);
                let certificate_association_data = buffer.read_octets(remaining)?;
                RecordTypeWithData::TLSA {
                    cert_usage,
                    selector,
                    matching_type,
                    certificate_association_data,
                }
            }
            RecordType::CAA => {
                let flags = buffer.read_u8()?;
                let tag_len = buffer.read_u8()?;
                let tag = buffer.read_octets(tag_len.into())?;
                let remaining = (rdata_start + usize::from(rdlength)).saturating_sub(buffer.pos);
                let value = buffer.read_octets(remaining)?;
                RecordTypeWithData::CAA { flags, tag, value }
            }
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: buffer.read_octets(rdlength.into())?,
            },
        };

        // Names embedded in RDATA can use compression pointers that jump
        // forward past the end of this record's nominal RDATA (e.g. a
        // pointer into an earlier RR) - realign to the RDLENGTH boundary
        // declared by the wire format rather than trusting how many bytes
        // the variant's fields actually consumed.
        buffer.pos = rdata_start + usize::from(rdlength);

        Ok(ResourceRecord {
            name,
            rtype_with_data,
            rclass,
            ttl,
        })
    }
}

/// A buffer which can be read from, for deserialisation purposes.
pub struct ReadableBuffer<'a> {
    octets: &'a [u8],
    pos: usize,
}

impl<'a> ReadableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self { octets, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self.octets.get(self.pos).ok_or(Error {
            id: None,
            kind: ErrorKind::TooShort,
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let b0 = self.read_u8()?;
        let b1 = self.read_u8()?;
        let b2 = self.read_u8()?;
        let b3 = self.read_u8()?;
        Ok(u32::from_be_bytes([b0, b1, b2, b3]))
    }

    fn read_ipv4(&mut self) -> Result<std::net::Ipv4Addr, Error> {
        let b0 = self.read_u8()?;
        let b1 = self.read_u8()?;
        let b2 = self.read_u8()?;
        let b3 = self.read_u8()?;
        Ok(std::net::Ipv4Addr::new(b0, b1, b2, b3))
    }

    fn read_ipv6(&mut self) -> Result<std::net::Ipv6Addr, Error> {
        let mut octets = [0u8; 16];
        for octet in &mut octets {
            *octet = self.read_u8()?;
        }
        Ok(std::net::Ipv6Addr::from(octets))
    }

    fn read_octets(&mut self, len: usize) -> Result<Bytes, Error> {
        if self.pos + len > self.octets.len() {
            return Err(Error {
                id: None,
                kind: ErrorKind::TooShort,
            });
        }
        let out = Bytes::copy_from_slice(&self.octets[self.pos..self.pos + len]);
        self.pos += len;
        Ok(out)
    }

    /// Read a (possibly compressed) domain name, following compression
    /// pointers.  Every pointer must point strictly backward in the
    /// buffer, which both guarantees termination and matches how this
    /// crate's own serialiser emits pointers.
    fn read_name(&mut self) -> Result<DomainName, Error> {
        let mut labels = Vec::new();
        let mut total_len = 0usize;
        let mut cur_pos = self.pos;
        let mut final_pos = None;
        let mut hops = 0;

        loop {
            let len_byte = *self.octets.get(cur_pos).ok_or(Error {
                id: None,
                kind: ErrorKind::TooShort,
            })?;

            if len_byte & 0b1100_0000 == 0b1100_0000 {
                let b2 = *self.octets.get(cur_pos + 1).ok_or(Error {
                    id: None,
                    kind: ErrorKind::TooShort,
                })?;
                let ptr = (usize::from(len_byte & 0b0011_1111) << 8) | usize::from(b2);

                if final_pos.is_none() {
                    final_pos = Some(cur_pos + 2);
                }

                hops += 1;
                if hops > MAX_POINTER_HOPS || ptr >= cur_pos {
                    return Err(Error {
                        id: None,
                        kind: ErrorKind::BadNameCompression,
                    });
                }
                cur_pos = ptr;
                continue;
            }

            if len_byte == 0 {
                labels.push(Label::new());
                cur_pos += 1;
                if final_pos.is_none() {
                    final_pos = Some(cur_pos);
                }
                break;
            }

            if len_byte > LABEL_MAX_LEN as u8 {
                return Err(Error {
                    id: None,
                    kind: ErrorKind::LabelTooLong,
                });
            }

            let len = usize::from(len_byte);
            let start = cur_pos + 1;
            let end = start + len;
            let label_octets = self.octets.get(start..end).ok_or(Error {
                id: None,
                kind: ErrorKind::TooShort,
            })?;
            let label: Label = label_octets.try_into().map_err(|_| Error {
                id: None,
                kind: ErrorKind::LabelTooLong,
            })?;

            total_len += usize::from(label.len()) + 1;
            if total_len > DOMAINNAME_MAX_LEN {
                return Err(Error {
                    id: None,
                    kind: ErrorKind::NameTooLong,
                });
            }

            labels.push(label);
            cur_pos = end;
        }

        self.pos = final_pos.unwrap_or(cur_pos);

        DomainName::from_labels(labels).ok_or(Error {
            id: None,
            kind: ErrorKind::BadName,
        })
    }
}

/// Errors encountered when deserialising a message.  Where the message
/// ID could be recovered before the error occurred, it is included so
/// the caller can send back a well-formed error response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Error {
    pub id: Option<u16>,
    pub kind: ErrorKind,
}

impl Error {
    pub fn id(&self) -> Option<u16> {
        self.id
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    TooShort,
    LabelTooLong,
    NameTooLong,
    BadName,
    BadNameCompression,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.kind {
            ErrorKind::TooShort => write!(f, "message is truncated"),
            ErrorKind::LabelTooLong => write!(f, "a label is longer than 63 octets"),
            ErrorKind::NameTooLong => write!(f, "a domain name is longer than 255 octets"),
            ErrorKind::BadName => write!(f, "a domain name is malformed"),
            ErrorKind::BadNameCompression => write!(f, "a compression pointer is malformed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn roundtrip_simple_query() {
        let message = Message::from_question(
            1234,
            Question {
                name: domain("www.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );

        let octets = message.clone().to_octets().unwrap();
        let parsed = Message::from_octets(&octets).unwrap();

        assert_eq!(message, parsed);
    }

    #[test]
    fn roundtrip_response_with_compressed_names() {
        let mut message = Message::from_question(
            42,
            Question {
                name: domain("www.example.com."),
                qtype: QueryType::Wildcard,
                qclass: QueryClass::Wildcard,
            },
        );
        message.header.is_response = true;
        message.answers.push(cname_record("www.example.com.", "example.com."));
        message.answers.push(a_record("example.com.", std::net::Ipv4Addr::new(1, 2, 3, 4)));
        message.answers.push(mx_record("example.com.", 10, "mail.example.com."));
        message.authority.push(ns_record("example.com.", "ns1.example.com."));

        let octets = message.clone().to_octets().unwrap();
        let parsed = Message::from_octets(&octets).unwrap();

        assert_eq!(message, parsed);
    }

    #[test]
    fn roundtrip_tlsa_and_caa() {
        let mut message = Message::from_question(
            7,
            Question {
                name: domain("_443._tcp.example.com."),
                qtype: QueryType::Record(RecordType::TLSA),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );
        message.header.is_response = true;
        message.answers.push(ResourceRecord {
            name: domain("_443._tcp.example.com."),
            rtype_with_data: RecordTypeWithData::TLSA {
                cert_usage: 3,
                selector: 1,
                matching_type: 1,
                certificate_association_data: Bytes::from_static(&[0xAB; 32]),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        });
        message.answers.push(ResourceRecord {
            name: domain("example.com."),
            rtype_with_data: RecordTypeWithData::CAA {
                flags: 0,
                tag: Bytes::from_static(b"issue"),
                value: Bytes::from_static(b"letsencrypt.org"),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        });

        let octets = message.clone().to_octets().unwrap();
        let parsed = Message::from_octets(&octets).unwrap();

        assert_eq!(message, parsed);
    }

    #[test]
    fn rejects_truncated_message() {
        assert!(Message::from_octets(&[0, 1, 2]).is_err());
    }

    #[test]
    fn rejects_forward_compression_pointers() {
        // A name that points forward at itself rather than backward.
        let bytes = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0b1100_0000, 12];
        let mut buffer = ReadableBuffer::new(&bytes);
        buffer.pos = 12;
        assert!(buffer.read_name().is_err());
    }
}
