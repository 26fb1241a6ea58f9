//! Method body header and exception section parsing and writing.
//!
//! A CIL method body starts with either a one-byte tiny header or a twelve-byte fat header,
//! followed by the code and, for fat bodies, optional extra data sections that hold the
//! exception handling table (ECMA-335 II.25.4).
//!
//! Parsing accepts both small and fat exception sections. Writing always produces the most
//! compact header that can represent the body and always emits fat exception sections, since
//! offsets of re-encoded code routinely exceed the 16-bit small clause limits.

use crate::{
    file::io::{read_le, read_le_at, write_le_at},
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBodyFlags, SectionFlags},
        token::Token,
    },
    Result,
};

/// Size of a fat header in bytes
const FAT_HEADER_SIZE: usize = 12;
/// Size of a fat exception clause in bytes
const FAT_CLAUSE_SIZE: usize = 24;
/// Size of a small exception clause in bytes
const SMALL_CLAUSE_SIZE: usize = 12;
/// Largest code size a tiny header can describe
const TINY_MAX_CODE: usize = 63;
/// Implicit evaluation stack size of tiny bodies
const TINY_MAX_STACK: usize = 8;

/// Describes the header and exception table of a method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Size of the code in bytes
    pub size_code: usize,
    /// Size of the header in bytes
    pub size_header: usize,
    /// `StandAloneSig` token describing the locals, `0` for none
    pub local_var_sig_token: u32,
    /// Maximum evaluation stack depth
    pub max_stack: usize,
    /// The header uses the fat format
    pub is_fat: bool,
    /// Locals are zero-initialized
    pub is_init_local: bool,
    /// The body carries an exception table
    pub is_exception_data: bool,
    /// Exception clauses in table order
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Parse a method body header and its exception sections.
    ///
    /// # Arguments
    /// * `data` - The body, starting at the header byte
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] for an empty buffer, a header that is neither
    /// tiny nor fat, or a declared header or code size that runs past the end of `data`.
    pub fn from(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_00000011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(malformed_error!(
                        "Tiny header declares {} code bytes, {} present",
                        size_code,
                        data.len() - 1
                    ));
                }

                Ok(MethodBody {
                    size_code,
                    size_header: 1,
                    local_var_sig_token: 0,
                    max_stack: TINY_MAX_STACK,
                    is_fat: false,
                    is_init_local: false,
                    is_exception_data: false,
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < FAT_HEADER_SIZE {
                    return Err(malformed_error!(
                        "Fat header needs {} bytes, {} present",
                        FAT_HEADER_SIZE,
                        data.len()
                    ));
                }

                let first_duo = read_le::<u16>(data)?;
                let size_header = ((first_duo >> 12) * 4) as usize;
                if size_header < FAT_HEADER_SIZE {
                    return Err(malformed_error!(
                        "Fat header declares a size of {} bytes",
                        size_header
                    ));
                }

                let size_code = read_le::<u32>(&data[4..])? as usize;
                if size_code
                    .checked_add(size_header)
                    .map_or(true, |end| end > data.len())
                {
                    return Err(malformed_error!(
                        "Fat header declares {} code bytes, {} present",
                        size_code,
                        data.len().saturating_sub(size_header)
                    ));
                }

                let local_var_sig_token = read_le::<u32>(&data[8..])?;
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000111111111111_u16);
                let max_stack = read_le::<u16>(&data[2..])? as usize;

                let exception_handlers = if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    read_sections(data, size_header + size_code)?
                } else {
                    Vec::new()
                };

                Ok(MethodBody {
                    size_code,
                    size_header,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local: flags_header.contains(MethodBodyFlags::INIT_LOCALS),
                    is_exception_data: !exception_handlers.is_empty(),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Total size of header and code in bytes, excluding extra sections
    #[must_use]
    pub fn size(&self) -> usize {
        self.size_code + self.size_header
    }

    /// Slice the code bytes out of the buffer this body was parsed from.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] if `data` is shorter than the body.
    pub fn code<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.size_header..self.size()).ok_or_else(|| {
            malformed_error!(
                "Body of {} bytes does not fit into {} bytes",
                self.size(),
                data.len()
            )
        })
    }
}

/// Walks the extra data sections following the code, collecting all exception clauses.
fn read_sections(data: &[u8], code_end: usize) -> Result<Vec<ExceptionHandler>> {
    let mut exception_handlers = Vec::new();
    let mut cursor = (code_end + 3) & !3;

    while data.len() >= cursor + 4 {
        let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(&data[cursor..])?);
        if !section_flags.contains(SectionFlags::EHTABLE) {
            break;
        }

        let is_fat = section_flags.contains(SectionFlags::FAT_FORMAT);
        let section_size = if is_fat {
            (read_le::<u32>(&data[cursor..])? >> 8) as usize
        } else {
            read_le::<u8>(&data[cursor + 1..])? as usize
        };
        if section_size < 4 || data.len() < cursor + section_size {
            return Err(malformed_error!(
                "Exception section of {} bytes at 0x{:x} exceeds the body",
                section_size,
                cursor
            ));
        }

        let section_end = cursor + section_size;
        cursor += 4;
        let clause_size = if is_fat {
            FAT_CLAUSE_SIZE
        } else {
            SMALL_CLAUSE_SIZE
        };

        for _ in 0..(section_size - 4) / clause_size {
            let (flags, try_offset, try_length, handler_offset, handler_length) = if is_fat {
                // Flags are a u32 in fat clauses, the upper half is always zero
                #[allow(clippy::cast_possible_truncation)]
                let flags = read_le_at::<u32>(data, &mut cursor)? as u16;
                (
                    flags,
                    read_le_at::<u32>(data, &mut cursor)?,
                    read_le_at::<u32>(data, &mut cursor)?,
                    read_le_at::<u32>(data, &mut cursor)?,
                    read_le_at::<u32>(data, &mut cursor)?,
                )
            } else {
                (
                    read_le_at::<u16>(data, &mut cursor)?,
                    u32::from(read_le_at::<u16>(data, &mut cursor)?),
                    u32::from(read_le_at::<u8>(data, &mut cursor)?),
                    u32::from(read_le_at::<u16>(data, &mut cursor)?),
                    u32::from(read_le_at::<u8>(data, &mut cursor)?),
                )
            };
            let class_or_filter = read_le_at::<u32>(data, &mut cursor)?;

            let flags = ExceptionHandlerFlags::from_bits_truncate(flags);
            let is_filter = flags.contains(ExceptionHandlerFlags::FILTER);
            let is_typed = !flags.intersects(
                ExceptionHandlerFlags::FILTER
                    | ExceptionHandlerFlags::FINALLY
                    | ExceptionHandlerFlags::FAULT,
            );
            exception_handlers.push(ExceptionHandler {
                flags,
                try_offset,
                try_length,
                handler_offset,
                handler_length,
                class_token: if is_typed {
                    Token::new(class_or_filter)
                } else {
                    Token::default()
                },
                filter_offset: if is_filter { class_or_filter } else { 0 },
            });
        }

        cursor = (section_end + 3) & !3;
        if !section_flags.contains(SectionFlags::MORE_SECTS) {
            break;
        }
    }

    Ok(exception_handlers)
}

/// Serializes a complete method body: header, code and exception section.
///
/// A tiny header is used when the code is shorter than 64 bytes, the stack depth does not
/// exceed 8 and there are neither locals, zero-initialization nor exception clauses.
/// Otherwise a fat header is written, followed by a dword-aligned fat exception section if
/// `handlers` is not empty.
///
/// # Errors
/// Returns [`crate::Error::MalformedBody`] if the code or exception table is too large for
/// the header encodings.
pub fn write_body(
    code: &[u8],
    max_stack: u16,
    local_var_sig_token: u32,
    init_locals: bool,
    handlers: &[ExceptionHandler],
) -> Result<Vec<u8>> {
    let is_tiny = code.len() <= TINY_MAX_CODE
        && usize::from(max_stack) <= TINY_MAX_STACK
        && local_var_sig_token == 0
        && !init_locals
        && handlers.is_empty();

    if is_tiny {
        let mut data = Vec::with_capacity(code.len() + 1);
        // Checked above, fits into six bits
        #[allow(clippy::cast_possible_truncation)]
        data.push(((code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        data.extend_from_slice(code);
        return Ok(data);
    }

    let Ok(size_code) = u32::try_from(code.len()) else {
        return Err(malformed_error!("Code of {} bytes is too large", code.len()));
    };

    let mut flags = MethodBodyFlags::FAT_FORMAT;
    if init_locals {
        flags |= MethodBodyFlags::INIT_LOCALS;
    }
    if !handlers.is_empty() {
        flags |= MethodBodyFlags::MORE_SECTS;
    }

    let code_end = FAT_HEADER_SIZE + code.len();
    let section_start = (code_end + 3) & !3;
    let section_size = 4 + handlers.len() * FAT_CLAUSE_SIZE;
    if section_size > 0x00FF_FFFF {
        return Err(malformed_error!(
            "{} exception clauses do not fit a single section",
            handlers.len()
        ));
    }

    let total = if handlers.is_empty() {
        code_end
    } else {
        section_start + section_size
    };
    let mut data = vec![0u8; total];
    let mut cursor = 0;

    write_le_at(&mut data, &mut cursor, flags.bits() | (3 << 12))?;
    write_le_at(&mut data, &mut cursor, max_stack)?;
    write_le_at(&mut data, &mut cursor, size_code)?;
    write_le_at(&mut data, &mut cursor, local_var_sig_token)?;
    data[cursor..code_end].copy_from_slice(code);

    if !handlers.is_empty() {
        cursor = section_start;
        // Section size is limited to 24 bits above
        #[allow(clippy::cast_possible_truncation)]
        let section_header = u32::from((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits())
            | ((section_size as u32) << 8);
        write_le_at(&mut data, &mut cursor, section_header)?;

        for handler in handlers {
            write_le_at(&mut data, &mut cursor, u32::from(handler.flags.bits()))?;
            write_le_at(&mut data, &mut cursor, handler.try_offset)?;
            write_le_at(&mut data, &mut cursor, handler.try_length)?;
            write_le_at(&mut data, &mut cursor, handler.handler_offset)?;
            write_le_at(&mut data, &mut cursor, handler.handler_length)?;
            write_le_at(&mut data, &mut cursor, handler.class_or_filter())?;
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny() -> Result<()> {
        // ldarg.0; ldarg.1; add; ret
        let data = [0x12, 0x02, 0x03, 0x58, 0x2A];

        let body = MethodBody::from(&data)?;

        assert!(!body.is_fat);
        assert!(!body.is_exception_data);
        assert!(!body.is_init_local);
        assert_eq!(body.max_stack, 8);
        assert_eq!(body.size_code, 4);
        assert_eq!(body.size_header, 1);
        assert_eq!(body.size(), 5);
        assert_eq!(body.code(&data)?, &[0x02, 0x03, 0x58, 0x2A]);
        Ok(())
    }

    #[test]
    fn tiny_truncated() {
        let data = [0x12, 0x02];
        assert!(matches!(
            MethodBody::from(&data),
            Err(crate::Error::MalformedBody { .. })
        ));
    }

    #[test]
    fn fat_truncated() {
        // Header cut short
        assert!(matches!(
            MethodBody::from(&[0x13, 0x30, 0x05, 0x00]),
            Err(crate::Error::MalformedBody { .. })
        ));
        // Header claims 0x10 code bytes, two follow
        let data = [
            0x13, 0x30, 0x05, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A,
        ];
        assert!(matches!(
            MethodBody::from(&data),
            Err(crate::Error::MalformedBody { .. })
        ));
    }

    #[test]
    fn code_outside_buffer() -> Result<()> {
        let body = MethodBody::from(&[0x0A, 0x00, 0x2A])?;
        assert!(matches!(
            body.code(&[0x0A]),
            Err(crate::Error::MalformedBody { .. })
        ));
        Ok(())
    }

    #[test]
    fn invalid_header() {
        assert!(MethodBody::from(&[]).is_err());
        assert!(matches!(
            MethodBody::from(&[0x01, 0x00]),
            Err(crate::Error::MalformedBody { .. })
        ));
    }

    #[test]
    fn fat() -> Result<()> {
        let data = [
            0x13, 0x30, // flags: fat, init locals, 3 dwords
            0x05, 0x00, // max stack
            0x02, 0x00, 0x00, 0x00, // code size
            0x59, 0x00, 0x00, 0x11, // local var sig token
            0x00, 0x2A,
        ];

        let body = MethodBody::from(&data)?;

        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert!(!body.is_exception_data);
        assert_eq!(body.max_stack, 5);
        assert_eq!(body.size_code, 2);
        assert_eq!(body.size_header, 12);
        assert_eq!(body.local_var_sig_token, 0x1100_0059);
        assert_eq!(body.code(&data)?, &[0x00, 0x2A]);
        Ok(())
    }

    #[test]
    fn fat_small_exception_section() -> Result<()> {
        let mut data = vec![
            0x1B, 0x30, // fat, more sects, init locals
            0x01, 0x00, // max stack
            0x06, 0x00, 0x00, 0x00, // code size
            0x00, 0x00, 0x00, 0x00, // no locals
            0x00, 0xDE, 0x02, 0x26, 0xDE, 0x00, // nop; leave.s; pop; leave.s
        ];
        // align to 4
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&[
            0x01, 0x10, 0x00, 0x00, // small EH section, 16 bytes
            0x00, 0x00, // flags: exception
            0x00, 0x00, // try offset
            0x03, // try length
            0x03, 0x00, // handler offset
            0x03, // handler length
            0x01, 0x00, 0x00, 0x01, // class token
        ]);

        let body = MethodBody::from(&data)?;

        assert!(body.is_exception_data);
        assert_eq!(body.exception_handlers.len(), 1);
        let handler = &body.exception_handlers[0];
        assert!(handler.is_typed());
        assert_eq!(handler.try_end(), 3);
        assert_eq!(handler.handler_offset, 3);
        assert_eq!(handler.handler_end(), 6);
        assert_eq!(handler.class_token, Token::new(0x0100_0001));
        Ok(())
    }

    #[test]
    fn write_tiny() -> Result<()> {
        let code = [0x02, 0x03, 0x58, 0x2A];
        let data = write_body(&code, 8, 0, false, &[])?;

        assert_eq!(data, vec![0x12, 0x02, 0x03, 0x58, 0x2A]);
        Ok(())
    }

    #[test]
    fn write_fat_with_handlers() -> Result<()> {
        let code = [0x00, 0xDD, 0x05, 0x00, 0x00, 0x00, 0x00, 0xDC, 0x2A];
        let handlers = vec![ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_offset: 0,
            try_length: 6,
            handler_offset: 6,
            handler_length: 2,
            class_token: Token::default(),
            filter_offset: 0,
        }];

        let data = write_body(&code, 2, 0x1100_0002, true, &handlers)?;
        let body = MethodBody::from(&data)?;

        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert_eq!(body.max_stack, 2);
        assert_eq!(body.local_var_sig_token, 0x1100_0002);
        assert_eq!(body.code(&data)?, &code);
        assert_eq!(body.exception_handlers, handlers);
        // header + code, padded to 4, then a 28 byte section
        assert_eq!(data.len(), 24 + 28);
        Ok(())
    }

    #[test]
    fn write_large_code_is_fat() -> Result<()> {
        let mut code = vec![0x00; 100];
        code.push(0x2A);

        let data = write_body(&code, 1, 0, false, &[])?;
        let body = MethodBody::from(&data)?;

        assert!(body.is_fat);
        assert_eq!(body.size_code, 101);
        assert_eq!(body.code(&data)?, code.as_slice());
        Ok(())
    }
}
