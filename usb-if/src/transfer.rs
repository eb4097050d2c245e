use num_enum::{FromPrimitive, IntoPrimitive};

/// Data stage direction of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request codes, USB 2.0 table 9-4 and USB 3.2 table 9-5.
///
/// Class requests that reuse a code (hub `CLEAR_TT_BUFFER` = 8, ...) are
/// carried as [`Request::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
    SetSel = 48,
    SetIsochDelay = 49,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Pack the `bmRequestType` byte.
pub fn request_type_byte(direction: Direction, request_type: RequestType, recipient: Recipient) -> u8 {
    let dir = match direction {
        Direction::Out => 0,
        Direction::In => 0x80,
    };
    dir | (u8::from(request_type) << 5) | u8::from(recipient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_byte() {
        // GET_STATUS to a hub port: 0xA3
        assert_eq!(
            request_type_byte(Direction::In, RequestType::Class, Recipient::Other),
            0xA3
        );
        // SET_FEATURE to a hub port: 0x23
        assert_eq!(
            request_type_byte(Direction::Out, RequestType::Class, Recipient::Other),
            0x23
        );
        assert_eq!(u8::from(Request::Other(8)), 8);
        assert_eq!(Request::from(48), Request::SetSel);
    }
}
