//! Kernel struct offset discovery from BTF
//!
//! The exit probe reads the thread's TLS base out of `task_struct`, whose
//! layout depends on the kernel build. The offset is resolved here, once, from
//! `/sys/kernel/btf/vmlinux` and handed to the probe through its `CONFIG` map.

use std::path::Path;

use btf_rs::{Btf, Type};
use log::debug;

use crate::domain::ProbeError;

const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// Member path from `task_struct` to the user TLS base on x86-64
pub const TLS_BASE_PATH: [&str; 2] = ["thread", "fsbase"];

/// Longest typedef/qualifier chain followed before giving up
const MAX_TYPE_CHAIN: usize = 32;

fn invalid(e: impl std::fmt::Display) -> ProbeError {
    ProbeError::InvalidBtf(e.to_string())
}

/// Kernel type information
pub struct KernelBtf {
    btf: Btf,
}

impl KernelBtf {
    /// Load the running kernel's BTF
    ///
    /// # Errors
    /// Returns an error if the file is missing (kernel built without
    /// `CONFIG_DEBUG_INFO_BTF`) or malformed.
    pub fn from_sys_fs() -> Result<Self, ProbeError> {
        Self::from_file(Path::new(VMLINUX_BTF))
    }

    /// # Errors
    /// Returns an error if the file cannot be read or is not raw BTF.
    pub fn from_file(path: &Path) -> Result<Self, ProbeError> {
        let btf = Btf::from_file(path).map_err(invalid)?;
        debug!("Loaded BTF from {}", path.display());
        Ok(Self { btf })
    }

    /// Follow typedefs and qualifiers down to the underlying type
    fn resolve(&self, mut ty: Type) -> Result<Type, ProbeError> {
        for _ in 0..MAX_TYPE_CHAIN {
            let next = match &ty {
                Type::Typedef(t) => Some(self.btf.resolve_chained_type(t)),
                Type::Const(t) => Some(self.btf.resolve_chained_type(t)),
                Type::Volatile(t) => Some(self.btf.resolve_chained_type(t)),
                Type::Restrict(t) => Some(self.btf.resolve_chained_type(t)),
                _ => None,
            };
            match next {
                Some(resolved) => ty = resolved.map_err(invalid)?,
                None => return Ok(ty),
            }
        }
        Err(ProbeError::InvalidBtf("typedef chain too long".to_string()))
    }

    /// Bit offset and type of `member` inside a struct or union, looking
    /// through anonymous members
    fn find_member(&self, ty: &Type, member: &str) -> Result<Option<(u64, Type)>, ProbeError> {
        let members = match ty {
            Type::Struct(s) => &s.members,
            Type::Union(u) => &u.members,
            _ => return Ok(None),
        };

        for m in members {
            let name = self.btf.resolve_name(m).map_err(invalid)?;
            if name == member {
                let member_type = self.btf.resolve_chained_type(m).map_err(invalid)?;
                return Ok(Some((u64::from(m.bit_offset()), member_type)));
            }
            if name.is_empty() {
                let inner = self.resolve(self.btf.resolve_chained_type(m).map_err(invalid)?)?;
                if let Some((bits, member_type)) = self.find_member(&inner, member)? {
                    return Ok(Some((u64::from(m.bit_offset()) + bits, member_type)));
                }
            }
        }
        Ok(None)
    }

    /// Byte offset of a (possibly nested) member, e.g. `task_struct` + `["thread", "fsbase"]`
    ///
    /// # Errors
    /// Returns an error if the struct or any member on the path is missing.
    pub fn member_offset(&self, type_name: &str, path: &[&str]) -> Result<u64, ProbeError> {
        let root = self
            .btf
            .resolve_type_by_name(type_name)
            .map_err(|_| ProbeError::BtfTypeNotFound(type_name.to_string()))?;
        let mut current = self.resolve(root)?;
        if !matches!(current, Type::Struct(_)) {
            return Err(ProbeError::BtfTypeNotFound(type_name.to_string()));
        }

        let mut current_name = type_name;
        let mut bits = 0u64;
        for member in path {
            let (member_bits, member_type) =
                self.find_member(&current, member)?.ok_or_else(|| {
                    ProbeError::BtfMemberNotFound {
                        type_name: current_name.to_string(),
                        member: (*member).to_string(),
                    }
                })?;
            bits += member_bits;
            current = self.resolve(member_type)?;
            current_name = member;
        }

        Ok(bits / 8)
    }

    /// Offset of the user TLS base inside `task_struct`
    ///
    /// # Errors
    /// Returns an error if the kernel's `task_struct` has no `thread.fsbase`.
    pub fn tls_base_offset(&self) -> Result<u64, ProbeError> {
        self.member_offset("task_struct", &TLS_BASE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BTF_MAGIC: u16 = 0xeb9f;
    const KIND_INT: u32 = 1;
    const KIND_STRUCT: u32 = 4;
    const KIND_UNION: u32 = 5;
    const KIND_CONST: u32 = 10;

    /// Minimal raw BTF writer for synthetic type graphs
    struct BtfBuilder {
        types: Vec<u8>,
        strings: Vec<u8>,
    }

    impl BtfBuilder {
        fn new() -> Self {
            Self { types: Vec::new(), strings: vec![0] }
        }

        fn string(&mut self, s: &str) -> u32 {
            if s.is_empty() {
                return 0;
            }
            let off = u32::try_from(self.strings.len()).unwrap();
            self.strings.extend_from_slice(s.as_bytes());
            self.strings.push(0);
            off
        }

        fn header(&mut self, name: &str, kind: u32, vlen: u32, size_or_type: u32) {
            let name_off = self.string(name);
            self.types.extend_from_slice(&name_off.to_ne_bytes());
            self.types.extend_from_slice(&((kind << 24) | vlen).to_ne_bytes());
            self.types.extend_from_slice(&size_or_type.to_ne_bytes());
        }

        fn int(&mut self, name: &str, size: u32) {
            self.header(name, KIND_INT, 0, size);
            self.types.extend_from_slice(&(size * 8).to_ne_bytes());
        }

        fn modifier(&mut self, kind: u32, target: u32) {
            self.header("", kind, 0, target);
        }

        fn composite(&mut self, kind: u32, name: &str, size: u32, members: &[(&str, u32, u32)]) {
            self.header(name, kind, u32::try_from(members.len()).unwrap(), size);
            for (member, type_id, bit_offset) in members {
                let off = self.string(member);
                self.types.extend_from_slice(&off.to_ne_bytes());
                self.types.extend_from_slice(&type_id.to_ne_bytes());
                self.types.extend_from_slice(&bit_offset.to_ne_bytes());
            }
        }

        fn build(self) -> Vec<u8> {
            let types_len = u32::try_from(self.types.len()).unwrap();
            let mut out = Vec::new();
            out.extend_from_slice(&BTF_MAGIC.to_ne_bytes());
            out.push(1); // version
            out.push(0); // flags
            out.extend_from_slice(&24u32.to_ne_bytes());
            out.extend_from_slice(&0u32.to_ne_bytes());
            out.extend_from_slice(&types_len.to_ne_bytes());
            out.extend_from_slice(&types_len.to_ne_bytes());
            out.extend_from_slice(&u32::try_from(self.strings.len()).unwrap().to_ne_bytes());
            out.extend_from_slice(&self.types);
            out.extend_from_slice(&self.strings);
            out
        }
    }

    fn kernel_like_btf() -> Vec<u8> {
        let mut b = BtfBuilder::new();
        b.int("long unsigned int", 8); // 1
        b.composite(KIND_STRUCT, "thread_struct", 24, &[("sp", 1, 0), ("fsbase", 1, 128)]); // 2
        b.modifier(KIND_CONST, 2); // 3
        b.composite(KIND_UNION, "", 8, &[("pid", 1, 0), ("tgid", 1, 0)]); // 4
        b.composite(
            KIND_STRUCT,
            "task_struct",
            64,
            &[("state", 1, 0), ("", 4, 64), ("thread", 3, 256)],
        ); // 5
        b.build()
    }

    fn load(bytes: &[u8]) -> (tempfile::NamedTempFile, Result<KernelBtf, ProbeError>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let btf = KernelBtf::from_file(file.path());
        (file, btf)
    }

    #[test]
    fn test_resolves_nested_member_through_const() {
        let (_file, btf) = load(&kernel_like_btf());
        // thread at byte 32, fsbase at byte 16 inside thread_struct
        assert_eq!(btf.unwrap().tls_base_offset().unwrap(), 48);
    }

    #[test]
    fn test_finds_member_inside_anonymous_union() {
        let (_file, btf) = load(&kernel_like_btf());
        assert_eq!(btf.unwrap().member_offset("task_struct", &["tgid"]).unwrap(), 8);
    }

    #[test]
    fn test_missing_member_is_reported() {
        let (_file, btf) = load(&kernel_like_btf());
        let err = btf.unwrap().member_offset("task_struct", &["thread", "gsbase"]).unwrap_err();
        assert!(err.to_string().contains("gsbase"));
        assert!(err.to_string().contains("thread"));
    }

    #[test]
    fn test_missing_struct_is_reported() {
        let (_file, btf) = load(&kernel_like_btf());
        assert!(matches!(
            btf.unwrap().member_offset("mm_struct", &["pgd"]),
            Err(ProbeError::BtfTypeNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = kernel_like_btf();
        bytes[0] = 0;
        bytes[1] = 0;
        let (_file, btf) = load(&bytes);
        assert!(matches!(btf, Err(ProbeError::InvalidBtf(_))));
    }
}
