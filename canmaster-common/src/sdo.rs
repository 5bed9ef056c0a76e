//! SDO request/response frame codecs
//!
//! Only the mandatory expedited and segmented transfer modes are implemented.
//! All SDO frames are 8 bytes; byte 0 is the command specifier, bytes 1-2
//! carry the object index little-endian, byte 3 the subindex.

use crate::messages::CanMessage;

/// SDO abort codes defined by CiA-301
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoProtocolTimedOut = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write-only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read-only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the object dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    ObjectCannotBeMapped = 0x0604_0041,
    /// The number and length of the objects to be mapped would exceed PDO length
    PdoLengthExceeded = 0x0604_0042,
    /// General parameter incompatibility reason
    GeneralParameterIncompatibility = 0x0604_0043,
    /// General internal incompatibility in the device
    GeneralInternalIncompatibility = 0x0604_0047,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low
    ValueTooLow = 0x0609_0032,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    DataCannotBeTransferred = 0x0800_0020,
    /// No data available
    NoDataAvailable = 0x0800_0024,
}

/// Error for [`AbortCode::try_from`] on an unrecognized code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownAbortCode(pub u32);

impl TryFrom<u32> for AbortCode {
    type Error = UnknownAbortCode;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use AbortCode::*;
        const CODES: &[AbortCode] = &[
            ToggleNotAlternated,
            SdoProtocolTimedOut,
            InvalidCommandSpecifier,
            OutOfMemory,
            UnsupportedAccess,
            WriteOnly,
            ReadOnly,
            NoSuchObject,
            ObjectCannotBeMapped,
            PdoLengthExceeded,
            GeneralParameterIncompatibility,
            GeneralInternalIncompatibility,
            HardwareError,
            DataTypeMismatch,
            DataTypeMismatchLengthHigh,
            DataTypeMismatchLengthLow,
            NoSuchSubIndex,
            InvalidValue,
            ValueTooHigh,
            ValueTooLow,
            GeneralError,
            DataCannotBeTransferred,
            NoDataAvailable,
        ];
        CODES
            .iter()
            .find(|c| **c as u32 == value)
            .copied()
            .ok_or(UnknownAbortCode(value))
    }
}

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to
/// receive other values and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl RawAbortCode {
    /// The numeric abort code
    pub fn raw(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => *code as u32,
            RawAbortCode::Unknown(code) => *code,
        }
    }
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "0x{code:08X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Error returned when parsing a malformed SDO frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MalformedSdoFrame;

fn index_from_bytes(bytes: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([bytes[1], bytes[2]]), bytes[3])
}

fn put_index(buf: &mut [u8; 8], index: u16, sub: u8) {
    buf[1..3].copy_from_slice(&index.to_le_bytes());
    buf[3] = sub;
}

/// A client-to-server SDO request frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoRequest {
    /// Initiate an upload (read) of an object
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object subindex
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    UploadSegment {
        /// Toggle bit, alternating per segment
        t: bool,
    },
    /// Initiate an expedited download carrying up to 4 data bytes
    ExpeditedDownload {
        /// Object index
        index: u16,
        /// Object subindex
        sub: u8,
        /// Number of data bytes in `data` that are valid
        len: u8,
        /// Data bytes (LSB first)
        data: [u8; 4],
    },
    /// Initiate a segmented download, announcing the total size
    InitiateDownload {
        /// Object index
        index: u16,
        /// Object subindex
        sub: u8,
        /// Total number of bytes which will be transferred
        size: u32,
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle bit, alternating per segment
        t: bool,
        /// Set on the final segment
        c: bool,
        /// Number of data bytes in `data` that are valid
        len: u8,
        /// Segment data
        data: [u8; 7],
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object subindex
        sub: u8,
        /// Reason for the abort
        code: AbortCode,
    },
}

impl SdoRequest {
    /// Initiate upload of an object
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Request an upload segment with the given toggle value
    pub fn upload_segment_request(t: bool) -> Self {
        SdoRequest::UploadSegment { t }
    }

    /// Build an expedited download from up to 4 bytes of data
    ///
    /// Panics if `data` is longer than 4 bytes.
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(data.len() <= 4);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        SdoRequest::ExpeditedDownload {
            index,
            sub,
            len: data.len() as u8,
            data: buf,
        }
    }

    /// Initiate a segmented download of `size` total bytes
    pub fn initiate_download(index: u16, sub: u8, size: u32) -> Self {
        SdoRequest::InitiateDownload { index, sub, size }
    }

    /// Build a download segment from up to 7 bytes of data
    ///
    /// Panics if `data` is longer than 7 bytes.
    pub fn download_segment(t: bool, last: bool, data: &[u8]) -> Self {
        assert!(data.len() <= 7);
        let mut buf = [0u8; 7];
        buf[..data.len()].copy_from_slice(data);
        SdoRequest::DownloadSegment {
            t,
            c: last,
            len: data.len() as u8,
            data: buf,
        }
    }

    /// Build an abort request
    pub fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        SdoRequest::Abort { index, sub, code }
    }

    /// Encode to an 8-byte frame payload
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        match *self {
            SdoRequest::InitiateUpload { index, sub } => {
                buf[0] = 0x40;
                put_index(&mut buf, index, sub);
            }
            SdoRequest::UploadSegment { t } => {
                buf[0] = 0x60 | ((t as u8) << 4);
            }
            SdoRequest::ExpeditedDownload {
                index,
                sub,
                len,
                data,
            } => {
                let n = 4 - len;
                buf[0] = 0x23 | (n << 2);
                put_index(&mut buf, index, sub);
                buf[4..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateDownload { index, sub, size } => {
                buf[0] = 0x21;
                put_index(&mut buf, index, sub);
                buf[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::DownloadSegment { t, c, len, data } => {
                let n = 7 - len;
                buf[0] = ((t as u8) << 4) | (n << 1) | c as u8;
                buf[1..8].copy_from_slice(&data);
            }
            SdoRequest::Abort { index, sub, code } => {
                buf[0] = 0x80;
                put_index(&mut buf, index, sub);
                buf[4..8].copy_from_slice(&(code as u32).to_le_bytes());
            }
        }
        buf
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = MalformedSdoFrame;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 8 {
            return Err(MalformedSdoFrame);
        }
        let cmd = bytes[0];
        let (index, sub) = index_from_bytes(bytes);
        match cmd >> 5 {
            // Download segment
            0 => {
                let t = cmd & 0x10 != 0;
                let n = (cmd >> 1) & 0x07;
                let c = cmd & 0x01 != 0;
                let mut data = [0u8; 7];
                data.copy_from_slice(&bytes[1..8]);
                Ok(SdoRequest::DownloadSegment {
                    t,
                    c,
                    len: 7 - n,
                    data,
                })
            }
            // Initiate download
            1 => {
                let e = cmd & 0x02 != 0;
                let s = cmd & 0x01 != 0;
                if e {
                    let n = if s { (cmd >> 2) & 0x03 } else { 0 };
                    let mut data = [0u8; 4];
                    data.copy_from_slice(&bytes[4..8]);
                    Ok(SdoRequest::ExpeditedDownload {
                        index,
                        sub,
                        len: 4 - n,
                        data,
                    })
                } else {
                    let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
                    Ok(SdoRequest::InitiateDownload { index, sub, size })
                }
            }
            // Initiate upload
            2 => Ok(SdoRequest::InitiateUpload { index, sub }),
            // Upload segment request
            3 => Ok(SdoRequest::UploadSegment {
                t: cmd & 0x10 != 0,
            }),
            // Abort
            4 => {
                let raw = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
                let code = AbortCode::try_from(raw).unwrap_or(AbortCode::GeneralError);
                Ok(SdoRequest::Abort { index, sub, code })
            }
            _ => Err(MalformedSdoFrame),
        }
    }
}

/// A server-to-client SDO response frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an initiate-upload request
    ConfirmUpload {
        /// Number of unused bytes in `data` (valid when `e && s`)
        n: u8,
        /// Expedited flag; data is in this frame
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// Object index echoed back
        index: u16,
        /// Object subindex echoed back
        sub: u8,
        /// Expedited data bytes, or the 32-bit total size when `e` is unset
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle bit
        t: bool,
        /// Number of bytes in `data` that do NOT contain data
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Acknowledge an initiate-download request
    ConfirmDownload {
        /// Object index echoed back
        index: u16,
        /// Object subindex echoed back
        sub: u8,
    },
    /// Acknowledge one download segment
    ConfirmDownloadSegment {
        /// Toggle bit echoed back
        t: bool,
    },
    /// The server aborted the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object subindex
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
}

impl SdoResponse {
    /// Build an expedited upload response carrying up to 4 bytes
    ///
    /// Panics if `data` is longer than 4 bytes.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(data.len() <= 4);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        SdoResponse::ConfirmUpload {
            n: 4 - data.len() as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Build a segmented-upload initiate response announcing `size` bytes
    pub fn segmented_upload(index: u16, sub: u8, size: u32) -> Self {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Build an upload segment from up to 7 bytes of data
    pub fn upload_segment(t: bool, last: bool, data: &[u8]) -> Self {
        assert!(data.len() <= 7);
        let mut buf = [0u8; 7];
        buf[..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment {
            t,
            n: 7 - data.len() as u8,
            c: last,
            data: buf,
        }
    }

    /// Build a download confirmation
    pub fn confirm_download(index: u16, sub: u8) -> Self {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Build an abort response
    pub fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: RawAbortCode::Valid(code),
        }
    }

    /// Encode to an 8-byte frame payload
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        match *self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                buf[0] = 0x40 | (n << 2) | ((e as u8) << 1) | s as u8;
                put_index(&mut buf, index, sub);
                buf[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                buf[0] = ((t as u8) << 4) | (n << 1) | c as u8;
                buf[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                buf[0] = 0x60;
                put_index(&mut buf, index, sub);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                buf[0] = 0x20 | ((t as u8) << 4);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                buf[0] = 0x80;
                put_index(&mut buf, index, sub);
                buf[4..8].copy_from_slice(&abort_code.raw().to_le_bytes());
            }
        }
        buf
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = MalformedSdoFrame;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 8 {
            return Err(MalformedSdoFrame);
        }
        let cmd = bytes[0];
        let (index, sub) = index_from_bytes(bytes);
        match cmd >> 5 {
            // Upload segment
            0 => {
                let mut data = [0u8; 7];
                data.copy_from_slice(&bytes[1..8]);
                Ok(SdoResponse::UploadSegment {
                    t: cmd & 0x10 != 0,
                    n: (cmd >> 1) & 0x07,
                    c: cmd & 0x01 != 0,
                    data,
                })
            }
            // Confirm download segment
            1 => Ok(SdoResponse::ConfirmDownloadSegment {
                t: cmd & 0x10 != 0,
            }),
            // Confirm upload
            2 => {
                let mut data = [0u8; 4];
                data.copy_from_slice(&bytes[4..8]);
                Ok(SdoResponse::ConfirmUpload {
                    n: (cmd >> 2) & 0x03,
                    e: cmd & 0x02 != 0,
                    s: cmd & 0x01 != 0,
                    index,
                    sub,
                    data,
                })
            }
            // Confirm download
            3 => Ok(SdoResponse::ConfirmDownload { index, sub }),
            // Abort
            4 => {
                let raw = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code: raw.into(),
                })
            }
            _ => Err(MalformedSdoFrame),
        }
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = MalformedSdoFrame;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        msg.data().try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiate_upload_encoding() {
        let req = SdoRequest::initiate_upload(0x1000, 0);
        assert_eq!([0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0], req.to_bytes());
    }

    #[test]
    fn test_expedited_upload_response_round_trip() {
        // Single byte at 0x1000sub0, as a server would answer a device-type read
        let resp = SdoResponse::expedited_upload(0x1000, 0, &[0x12]);
        let bytes = resp.to_bytes();
        assert_eq!([0x4F, 0x00, 0x10, 0x00, 0x12, 0, 0, 0], bytes);
        assert_eq!(resp, SdoResponse::try_from(&bytes[..]).unwrap());
    }

    #[test]
    fn test_segmented_download_initiate() {
        let req = SdoRequest::initiate_download(0x1017, 0, 7);
        assert_eq!([0x21, 0x17, 0x10, 0x00, 7, 0, 0, 0], req.to_bytes());
    }

    #[test]
    fn test_expedited_download_sizes() {
        let req = SdoRequest::expedited_download(0x6040, 0, &[0x0F, 0x00]);
        // n = 2 for a 2-byte payload
        assert_eq!(0x2B, req.to_bytes()[0]);
        let req = SdoRequest::expedited_download(0x6040, 0, &[1, 2, 3, 4]);
        assert_eq!(0x23, req.to_bytes()[0]);
    }

    #[test]
    fn test_download_segment_flags() {
        let req = SdoRequest::download_segment(false, true, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(0x01, req.to_bytes()[0]);
        let req = SdoRequest::download_segment(true, false, &[1, 2, 3]);
        // t=1, n=4, c=0
        assert_eq!(0x18, req.to_bytes()[0]);
    }

    #[test]
    fn test_abort_round_trip() {
        let resp = SdoResponse::abort(0x1234, 5, AbortCode::NoSuchObject);
        let bytes = resp.to_bytes();
        assert_eq!([0x80, 0x34, 0x12, 0x05, 0x00, 0x00, 0x02, 0x06], bytes);
        match SdoResponse::try_from(&bytes[..]).unwrap() {
            SdoResponse::Abort { abort_code, .. } => {
                assert_eq!(RawAbortCode::Valid(AbortCode::NoSuchObject), abort_code);
                assert_eq!(0x0602_0000, abort_code.raw());
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_unknown_abort_code_preserved() {
        let code = RawAbortCode::from(0xDEAD_BEEF);
        assert_eq!(RawAbortCode::Unknown(0xDEAD_BEEF), code);
        assert_eq!(0xDEAD_BEEF, code.raw());
    }

    #[test]
    fn test_request_parse_round_trip() {
        let reqs = [
            SdoRequest::initiate_upload(0x2000, 1),
            SdoRequest::upload_segment_request(true),
            SdoRequest::expedited_download(0x2000, 2, &[9, 8]),
            SdoRequest::initiate_download(0x2000, 3, 100),
            SdoRequest::download_segment(true, false, &[1, 2, 3, 4, 5]),
        ];
        for req in reqs {
            let bytes = req.to_bytes();
            assert_eq!(req, SdoRequest::try_from(&bytes[..]).unwrap());
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(SdoResponse::try_from(&[0x60u8, 0, 0][..]).is_err());
    }
}
