//! # Decode plan compilation
//!
//! The probe always emits the same record layout, so every offset the decoder
//! needs is computed once from the type description. The resulting
//! [`DecodePlan`] is immutable and shared by the streaming task and the
//! snapshot runner.
//!
//! Members are recognized by type name:
//!
//! | Type name          | Requirement                      | Decoded as            |
//! |--------------------|----------------------------------|-----------------------|
//! | `pk_mntns_id`      | typedef of an 8-byte integer     | `Event::mntns_id`     |
//! | `pk_timestamp`     | typedef of an 8-byte integer     | `Event::timestamps`   |
//! | `pk_l3endpoint_t`  | 20-byte struct                   | `Event::l3_endpoints` |
//! | `pk_l4endpoint_t`  | 24-byte struct                   | `Event::l4_endpoints` |
//! | any enum           | 1, 2, 4 or 8 bytes wide          | `Event::fields`       |
//!
//! Mismatches never fail compilation: the member is skipped and a
//! [`CompileWarning`] is logged and returned.

use super::btf::{EnumValue, KernelTypes, Struct, Type};
use super::events::EventFactory;
use probekit_common::{type_names, L3_ENDPOINT_SIZE, L4_ENDPOINT_SIZE};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Label for enum values missing from the value table
pub const UNKNOWN_ENUM_LABEL: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointKind {
    L3,
    L4,
}

impl EndpointKind {
    pub const fn size(self) -> usize {
        match self {
            EndpointKind::L3 => L3_ENDPOINT_SIZE,
            EndpointKind::L4 => L4_ENDPOINT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointField {
    pub name: String,
    pub offset: usize,
    pub kind: EndpointKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub const fn from_size(size: u32) -> Option<Self> {
        match size {
            1 => Some(IntWidth::W8),
            2 => Some(IntWidth::W16),
            4 => Some(IntWidth::W32),
            8 => Some(IntWidth::W64),
            _ => None,
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }
}

/// Reads one integer of a fixed width and signedness.
///
/// Signed values are sign-extended to 64 bits so they compare equal to the
/// sign-extended enum table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntReader {
    pub width: IntWidth,
    pub signed: bool,
}

impl IntReader {
    pub fn read(&self, data: &[u8], offset: usize) -> Option<u64> {
        let value = match (self.width, self.signed) {
            (IntWidth::W8, false) => u64::from(u8::from_ne_bytes(read_array(data, offset)?)),
            (IntWidth::W8, true) => i8::from_ne_bytes(read_array(data, offset)?) as u64,
            (IntWidth::W16, false) => u64::from(u16::from_ne_bytes(read_array(data, offset)?)),
            (IntWidth::W16, true) => i16::from_ne_bytes(read_array(data, offset)?) as u64,
            (IntWidth::W32, false) => u64::from(u32::from_ne_bytes(read_array(data, offset)?)),
            (IntWidth::W32, true) => i32::from_ne_bytes(read_array(data, offset)?) as u64,
            (IntWidth::W64, false) => u64::from_ne_bytes(read_array(data, offset)?),
            (IntWidth::W64, true) => i64::from_ne_bytes(read_array(data, offset)?) as u64,
        };
        Some(value)
    }
}

/// Copies `N` bytes starting at `offset`, `None` if they are out of range
pub(crate) fn read_array<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    data.get(offset..end)?.try_into().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumField {
    pub name: String,
    pub offset: usize,
    pub reader: IntReader,
    pub values: Vec<EnumValue>,
}

impl EnumField {
    pub fn label(&self, value: u64) -> &str {
        self.values
            .iter()
            .find(|v| v.value == value)
            .map_or(UNKNOWN_ENUM_LABEL, |v| v.name.as_str())
    }
}

/// Compiled byte-offset layout of one event record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodePlan {
    /// Size of one record as declared by the type description
    pub record_size: usize,
    pub mntns_id: Option<usize>,
    pub endpoints: Vec<EndpointField>,
    pub timestamps: Vec<usize>,
    pub enums: Vec<EnumField>,
}

/// Reason a member was left out of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileWarning {
    NotUint64 { member: String, reason: String },
    NotAStruct { member: String },
    WrongSize {
        member: String,
        expected: usize,
        got: u32,
    },
    OutOfBounds {
        member: String,
        offset: usize,
        size: usize,
        record_size: usize,
    },
    UnsupportedEnumWidth { member: String, size: u32 },
    UnboundField { member: String },
    KernelTypesUnavailable,
}

impl fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileWarning::NotUint64 { member, reason } => {
                write!(f, "{} is not a uint64: {}", member, reason)
            }
            CompileWarning::NotAStruct { member } => write!(f, "{} is not a struct", member),
            CompileWarning::WrongSize {
                member,
                expected,
                got,
            } => write!(
                f,
                "{} has a wrong size, expected {}, got {}",
                member, expected, got
            ),
            CompileWarning::OutOfBounds {
                member,
                offset,
                size,
                record_size,
            } => write!(
                f,
                "{} at offset {} ({} bytes) exceeds the record size {}",
                member, offset, size, record_size
            ),
            CompileWarning::UnsupportedEnumWidth { member, size } => {
                write!(f, "{} is an enum of unsupported size {}", member, size)
            }
            CompileWarning::UnboundField { member } => {
                write!(f, "{} is not a field of the event", member)
            }
            CompileWarning::KernelTypesUnavailable => write!(
                f,
                "Kernel BTF information not available. Enums won't be resolved with kernel values"
            ),
        }
    }
}

/// Compiles the decode plan for `event`.
///
/// Deterministic: the same description, kernel types and factory always
/// produce an equal plan and the same warnings.
pub fn compile(
    event: &Struct,
    kernel: &dyn KernelTypes,
    factory: &EventFactory,
) -> (DecodePlan, Vec<CompileWarning>) {
    let mut compiler = Compiler {
        plan: DecodePlan {
            record_size: event.size as usize,
            ..DecodePlan::default()
        },
        warnings: Vec::new(),
        kernel,
        kernel_checked: false,
    };

    for member in &event.members {
        compiler.member(&member.name, member.offset as usize, &member.ty, factory);
    }

    for warning in &compiler.warnings {
        warn!("{}", warning);
    }
    debug!(
        "Compiled decode plan for {:?}: record_size={}, endpoints={}, timestamps={}, enums={}",
        event.name,
        compiler.plan.record_size,
        compiler.plan.endpoints.len(),
        compiler.plan.timestamps.len(),
        compiler.plan.enums.len()
    );

    (compiler.plan, compiler.warnings)
}

struct Compiler<'k> {
    plan: DecodePlan,
    warnings: Vec<CompileWarning>,
    kernel: &'k dyn KernelTypes,
    kernel_checked: bool,
}

impl Compiler<'_> {
    fn member(&mut self, name: &str, offset: usize, ty: &Type, factory: &EventFactory) {
        match ty.name() {
            type_names::MNTNS_ID => {
                if self.uint64_typedef(name, offset, ty) {
                    self.plan.mntns_id = Some(offset);
                }
            }
            type_names::TIMESTAMP => {
                if self.uint64_typedef(name, offset, ty) {
                    self.plan.timestamps.push(offset);
                }
            }
            type_names::L3_ENDPOINT => self.endpoint(name, offset, ty, EndpointKind::L3),
            type_names::L4_ENDPOINT => self.endpoint(name, offset, ty, EndpointKind::L4),
            _ => {}
        }

        if let Some(Type::Enum(declared)) = ty.resolve() {
            let Some(width) = IntWidth::from_size(declared.size) else {
                self.warnings.push(CompileWarning::UnsupportedEnumWidth {
                    member: name.to_string(),
                    size: declared.size,
                });
                return;
            };
            if !factory.binds(name) {
                self.warnings.push(CompileWarning::UnboundField {
                    member: name.to_string(),
                });
                return;
            }
            if !self.in_bounds(name, offset, width.bytes()) {
                return;
            }

            let values = self
                .kernel_enum(&declared.name)
                .unwrap_or_else(|| declared.values.clone());

            self.plan.enums.push(EnumField {
                name: name.to_string(),
                offset,
                reader: IntReader {
                    width,
                    signed: declared.signed,
                },
                values,
            });
        }
    }

    fn uint64_typedef(&mut self, name: &str, offset: usize, ty: &Type) -> bool {
        if let Err(reason) = verify_uint64_typedef(ty) {
            self.warnings.push(CompileWarning::NotUint64 {
                member: name.to_string(),
                reason,
            });
            return false;
        }
        self.in_bounds(name, offset, 8)
    }

    fn endpoint(&mut self, name: &str, offset: usize, ty: &Type, kind: EndpointKind) {
        let Type::Struct(s) = ty else {
            self.warnings.push(CompileWarning::NotAStruct {
                member: name.to_string(),
            });
            return;
        };
        if s.size as usize != kind.size() {
            self.warnings.push(CompileWarning::WrongSize {
                member: name.to_string(),
                expected: kind.size(),
                got: s.size,
            });
            return;
        }
        if self.in_bounds(name, offset, kind.size()) {
            self.plan.endpoints.push(EndpointField {
                name: name.to_string(),
                offset,
                kind,
            });
        }
    }

    fn in_bounds(&mut self, name: &str, offset: usize, size: usize) -> bool {
        if offset + size <= self.plan.record_size {
            return true;
        }
        self.warnings.push(CompileWarning::OutOfBounds {
            member: name.to_string(),
            offset,
            size,
            record_size: self.plan.record_size,
        });
        false
    }

    /// Kernel values win over the program's when both define the enum
    fn kernel_enum(&mut self, name: &str) -> Option<Vec<EnumValue>> {
        if !self.kernel.is_available() {
            if !self.kernel_checked {
                self.kernel_checked = true;
                self.warnings.push(CompileWarning::KernelTypesUnavailable);
            }
            return None;
        }
        if name.is_empty() {
            return None;
        }
        self.kernel.lookup_enum(name).map(|e| e.values)
    }
}

fn verify_uint64_typedef(ty: &Type) -> Result<(), String> {
    if !matches!(ty, Type::Typedef(_)) {
        return Err("not a typedef".to_string());
    }
    match ty.resolve() {
        Some(Type::Int(int)) if int.size == 8 => Ok(()),
        Some(Type::Int(int)) => Err(format!("bad sized. Expected 8, got {}", int.size)),
        Some(_) => Err("not an integer".to_string()),
        None => Err("typedef chain does not terminate".to_string()),
    }
}
