use std::collections::HashMap;
use std::fmt;

use shared::error::{Error, Result};

const NAME_LEN: usize = 255;

/// A fully-qualified, dot-terminated domain name.
///
/// Stored in presentation form (`"host.example.com."`); the wire form with
/// label lengths and optional compression pointers is produced on pack.
#[derive(Default, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Name {
    pub data: String,
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data)
    }
}

impl Name {
    /// Builds a name from presentation form, appending the trailing dot when
    /// absent.
    pub fn new(data: &str) -> Result<Self> {
        let data = if data.ends_with('.') || data.is_empty() {
            data.to_string()
        } else {
            format!("{data}.")
        };
        if data.len() > NAME_LEN {
            Err(Error::ErrNameTooLong)
        } else {
            Ok(Name { data })
        }
    }

    /// The root name (`"."`, zero labels).
    pub fn root() -> Self {
        Name {
            data: ".".to_owned(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.data == "." || self.data.is_empty()
    }

    /// Iterator over the labels of this name, leftmost first.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.data.split('.').filter(|l| !l.is_empty())
    }

    pub fn label_count(&self) -> usize {
        self.labels().count()
    }

    /// The name with the leftmost label removed; `None` at the root.
    pub fn parent(&self) -> Option<Name> {
        let mut labels = self.data.splitn(2, '.');
        labels.next()?;
        let rest = labels.next()?;
        if rest.is_empty() {
            if self.is_root() {
                None
            } else {
                Some(Name::root())
            }
        } else {
            Some(Name {
                data: rest.to_string(),
            })
        }
    }

    /// Case-insensitive test whether `suffix` is this name or one of its
    /// ancestors.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        if suffix.is_root() {
            return true;
        }
        let mine: Vec<&str> = self.labels().collect();
        let theirs: Vec<&str> = suffix.labels().collect();
        if theirs.len() > mine.len() {
            return false;
        }
        mine[mine.len() - theirs.len()..]
            .iter()
            .zip(theirs.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Prepends `prefix` (a service type such as `_dns-update._udp.`).
    pub fn prepend(&self, prefix: &str) -> Result<Name> {
        let prefix = prefix.trim_end_matches('.');
        if self.is_root() {
            Name::new(prefix)
        } else {
            Name::new(&format!("{}.{}", prefix, self.data))
        }
    }

    // pack appends the wire format of the Name to msg.
    //
    // compression is a mapping of suffixes to their offsets in msg, for
    // message compression. compression_off is the offset of the start of the
    // message in msg (non-zero when the message is embedded in a larger
    // buffer).
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        let data = self.data.as_bytes();

        // Add a trailing dot to canonicalize name.
        if data.is_empty() || data[data.len() - 1] != b'.' {
            return Err(Error::Other(format!("name {} not fully qualified", self)));
        }

        // Allow root domain.
        if self.data == "." {
            msg.push(0);
            return Ok(msg);
        }

        // Emit sequence of counted strings, chopping at dots.
        let mut begin = 0;
        for i in 0..data.len() {
            if data[i] != b'.' {
                continue;
            }
            // The two most significant bits of a label length are flags.
            if i - begin >= 1 << 6 {
                return Err(Error::ErrLabelTooLong);
            }
            if i == begin {
                return Err(Error::ErrZeroSegLen);
            }

            // Check whether the rest of the name, from this label on, has
            // already been packed; emit a pointer to it when so.
            if let Some(cmap) = compression
                && let Some(ptr) = cmap.get(&self.data[begin..])
            {
                // Pointers are two bytes with the two most significant
                // bits set.
                msg.push(((ptr >> 8) | 0xC0) as u8);
                msg.push((ptr & 0xFF) as u8);
                return Ok(msg);
            }

            // Miss; remember this suffix for future compression, as long as
            // its offset still fits in the 14 pointer bits.
            if let Some(cmap) = compression
                && msg.len() - compression_off < 1 << 14
            {
                cmap.insert(self.data[begin..].to_string(), msg.len() - compression_off);
            }

            msg.push((i - begin) as u8);
            msg.extend_from_slice(&data[begin..i]);
            begin = i + 1;
        }

        msg.push(0);
        Ok(msg)
    }

    // unpack parses a wire-format name at msg[off:], following compression
    // pointers, and returns the offset just past the name in the original
    // stream.
    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        // curr is adjusted as this function iterates through the name; it is
        // the offset of the next byte to process.
        let mut curr = off;
        // new_off is the offset where the next record will start. Pointers
        // lead to data that belongs to other names and thus doesn't count
        // toward this name's length.
        let mut new_off = off;
        let mut ptr_seen = false;
        let mut ptr_count = 0;
        let mut name = String::new();

        loop {
            if curr >= msg.len() {
                return Err(Error::ErrBaseLen);
            }
            let c = msg[curr];
            match c & 0xC0 {
                0x00 => {
                    // String segment
                    if c == 0x00 {
                        // A zero length signals the end of the name.
                        curr += 1;
                        if !ptr_seen {
                            new_off = curr;
                        }
                        break;
                    }
                    let end = curr + 1 + c as usize;
                    if end > msg.len() {
                        return Err(Error::ErrCalcLen);
                    }
                    for &b in &msg[curr + 1..end] {
                        name.push(b as char);
                    }
                    name.push('.');
                    curr = end;
                    if !ptr_seen {
                        new_off = curr;
                    }
                }
                0xC0 => {
                    // Pointer
                    if curr + 1 >= msg.len() {
                        return Err(Error::ErrInvalidPtr);
                    }
                    if !ptr_seen {
                        // The first pointer defines where the record resumes.
                        new_off = curr + 2;
                        ptr_seen = true;
                    }
                    ptr_count += 1;
                    if ptr_count > 10 {
                        return Err(Error::ErrTooManyPtr);
                    }
                    curr = (((c ^ 0xC0) as usize) << 8) | msg[curr + 1] as usize;
                }
                // Prefixes 0x80 and 0x40 are reserved.
                _ => return Err(Error::ErrReservedLabelPrefix),
            }
        }

        if name.is_empty() {
            name.push('.');
        }
        if name.len() > NAME_LEN {
            return Err(Error::ErrCalcLen);
        }
        self.data = name;
        Ok(new_off)
    }

    pub(crate) fn skip(msg: &[u8], off: usize) -> Result<usize> {
        let mut curr = off;
        loop {
            if curr >= msg.len() {
                return Err(Error::ErrBaseLen);
            }
            let c = msg[curr];
            match c & 0xC0 {
                0x00 => {
                    if c == 0x00 {
                        return Ok(curr + 1);
                    }
                    curr += 1 + c as usize;
                }
                0xC0 => return Ok(curr + 2),
                _ => return Err(Error::ErrReservedLabelPrefix),
            }
        }
    }

    /// Canonical (lowercased, uncompressed) wire form, as used when a name
    /// is fed into a message authentication code.
    pub(crate) fn canonical_wire(&self) -> Result<Vec<u8>> {
        let lowered = Name {
            data: self.data.to_ascii_lowercase(),
        };
        lowered.pack(vec![], &mut None, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_new_appends_dot() {
        let n = Name::new("host.example.com").unwrap();
        assert_eq!(n.data, "host.example.com.");
        let n = Name::new("host.example.com.").unwrap();
        assert_eq!(n.data, "host.example.com.");
    }

    #[test]
    fn test_name_parent_walk() {
        let n = Name::new("a.b.c.").unwrap();
        let p1 = n.parent().unwrap();
        assert_eq!(p1.data, "b.c.");
        let p2 = p1.parent().unwrap();
        assert_eq!(p2.data, "c.");
        let p3 = p2.parent().unwrap();
        assert!(p3.is_root());
        assert!(p3.parent().is_none());
    }

    #[test]
    fn test_name_ends_with() {
        let n = Name::new("Host.Example.COM.").unwrap();
        assert!(n.ends_with(&Name::new("example.com.").unwrap()));
        assert!(n.ends_with(&Name::new("com.").unwrap()));
        assert!(n.ends_with(&Name::root()));
        assert!(!n.ends_with(&Name::new("other.com.").unwrap()));
        assert!(!n.ends_with(&Name::new("xample.com.").unwrap()));
    }

    #[test]
    fn test_name_pack_unpack_round_trip() {
        let n = Name::new("update.example.com.").unwrap();
        let msg = n.pack(vec![], &mut None, 0).unwrap();
        let mut out = Name::default();
        let off = out.unpack(&msg, 0).unwrap();
        assert_eq!(off, msg.len());
        assert_eq!(out.data, n.data);
    }

    #[test]
    fn test_name_pack_compression() {
        let mut compression = Some(HashMap::new());
        let a = Name::new("host.example.com.").unwrap();
        let b = Name::new("other.example.com.").unwrap();
        let msg = a.pack(vec![], &mut compression, 0).unwrap();
        let len_first = msg.len();
        let msg = b.pack(msg, &mut compression, 0).unwrap();
        // Second name must end with a 2-byte pointer, not a full copy.
        assert!(msg.len() < len_first + b.data.len() + 1);
        assert_eq!(msg[msg.len() - 2] & 0xC0, 0xC0);

        let mut out = Name::default();
        out.unpack(&msg, len_first).unwrap();
        assert_eq!(out.data, b.data);
    }

    #[test]
    fn test_name_unpack_pointer_loop() {
        // A pointer that points at itself must not hang.
        let msg = vec![0xC0, 0x00];
        let mut out = Name::default();
        assert!(out.unpack(&msg, 0).is_err());
    }
}
