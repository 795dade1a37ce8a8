//! Kernel enums from the running kernel's BTF

use btf_rs::{Btf, Type};
use log::{debug, warn};
use probekit::ebpf::btf::{Enum, EnumValue, KernelTypes};

const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

pub struct BtfKernelTypes {
    btf: Option<Btf>,
}

impl BtfKernelTypes {
    /// Loads vmlinux BTF; without it no kernel enum can be resolved
    pub fn load() -> Self {
        match Btf::from_file(VMLINUX_BTF) {
            Ok(btf) => Self { btf: Some(btf) },
            Err(e) => {
                warn!("Kernel BTF unavailable at {}: {}", VMLINUX_BTF, e);
                Self { btf: None }
            }
        }
    }

    fn convert(btf: &Btf, name: &str, ty: &Type) -> Option<Enum> {
        let values = match ty {
            Type::Enum(e) => {
                let signed = e.is_signed();
                let mut values = Vec::with_capacity(e.members.len());
                for member in &e.members {
                    let raw = member.val() as i32;
                    values.push(EnumValue {
                        name: btf.resolve_name(member).ok()?,
                        value: if signed { raw as i64 as u64 } else { raw as u32 as u64 },
                    });
                }
                (e.size(), signed, values)
            }
            Type::Enum64(e) => {
                let mut values = Vec::with_capacity(e.members.len());
                for member in &e.members {
                    values.push(EnumValue {
                        name: btf.resolve_name(member).ok()?,
                        value: member.val(),
                    });
                }
                (e.size(), e.is_signed(), values)
            }
            _ => return None,
        };

        let (size, signed, values) = values;
        Some(Enum {
            name: name.to_string(),
            size: size as u32,
            signed,
            values,
        })
    }
}

impl KernelTypes for BtfKernelTypes {
    fn is_available(&self) -> bool {
        self.btf.is_some()
    }

    fn lookup_enum(&self, name: &str) -> Option<Enum> {
        let btf = self.btf.as_ref()?;
        let types = match btf.resolve_types_by_name(name) {
            Ok(types) => types,
            Err(e) => {
                debug!("Kernel enum {} not found: {}", name, e);
                return None;
            }
        };
        types.iter().find_map(|ty| Self::convert(btf, name, ty))
    }
}
