//! Redirect sequences written over a function entry
//!
//! Each sequence loads the absolute target into a scratch register and jumps
//! through it, so the old and new code may live anywhere in the address
//! space. Scratch registers are caller-saved and unused for arguments.
//!
//! | arch    | convention | bytes | sequence                                   |
//! |---------|------------|-------|--------------------------------------------|
//! | x86_64  | direct     | 13    | `movabs r11, imm64; jmp r11`               |
//! | x86_64  | indirect   | 13    | `movabs r11, imm64; jmp [r11]`             |
//! | x86     | direct     | 7     | `mov eax, imm32; jmp eax`                  |
//! | x86     | indirect   | 7     | `mov eax, imm32; jmp [eax]`                |
//! | aarch64 | direct     | 16    | `ldr x16, #8; br x16; .quad`               |
//! | aarch64 | indirect   | 20    | `ldr x16, #12; ldr x16, [x16]; br x16; .quad` |

use std::fmt;

use crate::domain::{Address, CallConvention};

/// Largest sequence any supported architecture emits
pub const MAX_REDIRECT_LEN: usize = 24;

/// Encoded redirect held inline; building one never allocates
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RedirectCode {
    bytes: [u8; MAX_REDIRECT_LEN],
    len: usize,
}

impl RedirectCode {
    fn new() -> Self {
        Self { bytes: [0; MAX_REDIRECT_LEN], len: 0 }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for RedirectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The code-generation primitive behind the redirect installer
pub trait RedirectEncoder: Send + Sync {
    /// Bytes a function entry must own to host any redirect
    fn len(&self) -> usize;

    /// Redirect placed at `from` that transfers control to `to`
    fn encode(&self, from: Address, to: Address, convention: CallConvention) -> RedirectCode;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Aarch64,
}

impl Arch {
    #[cfg(target_arch = "x86_64")]
    pub const NATIVE: Arch = Arch::X86_64;
    #[cfg(target_arch = "x86")]
    pub const NATIVE: Arch = Arch::X86;
    #[cfg(target_arch = "aarch64")]
    pub const NATIVE: Arch = Arch::Aarch64;

    /// Worst case over both conventions
    #[must_use]
    pub fn redirect_len(self) -> usize {
        match self {
            Arch::X86 => 7,
            Arch::X86_64 => 13,
            Arch::Aarch64 => 20,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86 => write!(f, "x86"),
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
compile_error!("hotfix supports x86, x86_64 and aarch64 only");

/// Load-absolute-and-jump encoder
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteJump {
    arch: Arch,
}

impl AbsoluteJump {
    #[must_use]
    pub fn native() -> Self {
        Self { arch: Arch::NATIVE }
    }

    /// Encoder for another architecture, for offline inspection
    #[must_use]
    pub fn for_arch(arch: Arch) -> Self {
        Self { arch }
    }

    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }
}

impl RedirectEncoder for AbsoluteJump {
    fn len(&self) -> usize {
        self.arch.redirect_len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self, _from: Address, to: Address, convention: CallConvention) -> RedirectCode {
        let mut code = RedirectCode::new();
        let indirect = convention == CallConvention::Indirect;
        match self.arch {
            Arch::X86_64 => {
                code.push(&[0x49, 0xBB]);
                code.push(&to.0.to_le_bytes());
                code.push(if indirect { &[0x41, 0xFF, 0x23] } else { &[0x41, 0xFF, 0xE3] });
            }
            Arch::X86 => {
                code.push(&[0xB8]);
                code.push(&(to.0 as u32).to_le_bytes());
                code.push(if indirect { &[0xFF, 0x20] } else { &[0xFF, 0xE0] });
            }
            Arch::Aarch64 => {
                if indirect {
                    code.push(&0x5800_0070u32.to_le_bytes()); // ldr x16, #12
                    code.push(&0xF940_0210u32.to_le_bytes()); // ldr x16, [x16]
                } else {
                    code.push(&0x5800_0050u32.to_le_bytes()); // ldr x16, #8
                }
                code.push(&0xD61F_0200u32.to_le_bytes()); // br x16
                code.push(&to.0.to_le_bytes());
            }
        }
        code
    }
}
