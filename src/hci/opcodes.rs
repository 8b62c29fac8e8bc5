//! Command opcodes
//!
//! An opcode is the OGF (OpCode Group Field, upper 6 bits) and OCF (OpCode Command Field, lower
//! 10 bits) pair that identifies one HCI command on the wire. The enums here cover the commands
//! this stack issues, grouped the way the bluetooth specification groups them.

/// One HCI command known to this stack
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum HciCommand {
    LinkControl(LinkControl),
    ControllerAndBaseband(ControllerAndBaseband),
    InformationParameters(InformationParameters),
    LeController(LeController),
}

impl HciCommand {
    pub fn as_opcode_pair(&self) -> OpCodePair {
        match *self {
            HciCommand::LinkControl(ref ocf) => ocf.as_opcode_pair(),
            HciCommand::ControllerAndBaseband(ref ocf) => ocf.as_opcode_pair(),
            HciCommand::InformationParameters(ref ocf) => ocf.as_opcode_pair(),
            HciCommand::LeController(ref ocf) => ocf.as_opcode_pair(),
        }
    }

    /// The opcode as it appears in a command packet and in command replies
    pub fn as_opcode(&self) -> u16 {
        self.as_opcode_pair().as_opcode()
    }

    /// Recover the command from a raw opcode
    ///
    /// Returns `None` for opcodes this stack never issues, which for replies means the
    /// controller is talking about a command we do not have outstanding.
    pub fn from_opcode( opcode: u16 ) -> Option<Self> {
        let pair = OpCodePair::from_opcode(opcode);

        match pair.ogf {
            LinkControl::OGF => LinkControl::from_ocf(pair.ocf).map(HciCommand::LinkControl),
            ControllerAndBaseband::OGF =>
                ControllerAndBaseband::from_ocf(pair.ocf).map(HciCommand::ControllerAndBaseband),
            InformationParameters::OGF =>
                InformationParameters::from_ocf(pair.ocf).map(HciCommand::InformationParameters),
            LeController::OGF => LeController::from_ocf(pair.ocf).map(HciCommand::LeController),
            _ => None,
        }
    }
}

/// A pair of the OGF (OpCode Group Field) and OCF (OpCode Command Field)
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub struct OpCodePair {
    pub ogf: u16,
    pub ocf: u16,
}

impl OpCodePair {
    pub fn as_opcode(&self) -> u16 {
        (self.ogf << 10) | (self.ocf & 0x3FF)
    }

    pub fn from_opcode( opcode: u16 ) -> Self {
        OpCodePair {
            ogf: opcode >> 10,
            ocf: opcode & 0x3FF,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum LinkControl {
    CreateConnection,
    Disconnect,
    CreateConnectionCancel,
    AuthenticationRequested,
    SetConnectionEncryption,
}

impl LinkControl {
    const OGF: u16 = 0x1;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::LinkControl::*;

        OpCodePair {
            ogf: LinkControl::OGF,
            ocf: match *self {
                CreateConnection => 0x5,
                Disconnect => 0x6,
                CreateConnectionCancel => 0x8,
                AuthenticationRequested => 0x11,
                SetConnectionEncryption => 0x13,
            }
        }
    }

    fn from_ocf( ocf: u16 ) -> Option<Self> {
        use self::LinkControl::*;

        match ocf {
            0x5 => Some(CreateConnection),
            0x6 => Some(Disconnect),
            0x8 => Some(CreateConnectionCancel),
            0x11 => Some(AuthenticationRequested),
            0x13 => Some(SetConnectionEncryption),
            _ => None,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ControllerAndBaseband {
    SetEventMask,
    Reset,
}

impl ControllerAndBaseband {
    const OGF: u16 = 0x3;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::ControllerAndBaseband::*;

        OpCodePair {
            ogf: ControllerAndBaseband::OGF,
            ocf: match *self {
                SetEventMask => 0x1,
                Reset => 0x3,
            }
        }
    }

    fn from_ocf( ocf: u16 ) -> Option<Self> {
        use self::ControllerAndBaseband::*;

        match ocf {
            0x1 => Some(SetEventMask),
            0x3 => Some(Reset),
            _ => None,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum InformationParameters {
    ReadLocalSupportedCommands,
    ReadLocalSupportedFeatures,
    ReadLocalExtendedFeatures,
    ReadBufferSize,
    #[allow(non_camel_case_types)] ReadBD_ADDR,
}

impl InformationParameters {
    const OGF: u16 = 0x4;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::InformationParameters::*;

        OpCodePair {
            ogf: InformationParameters::OGF,
            ocf: match *self {
                ReadLocalSupportedCommands => 0x2,
                ReadLocalSupportedFeatures => 0x3,
                ReadLocalExtendedFeatures => 0x4,
                ReadBufferSize => 0x5,
                ReadBD_ADDR => 0x9,
            }
        }
    }

    fn from_ocf( ocf: u16 ) -> Option<Self> {
        use self::InformationParameters::*;

        match ocf {
            0x2 => Some(ReadLocalSupportedCommands),
            0x3 => Some(ReadLocalSupportedFeatures),
            0x4 => Some(ReadLocalExtendedFeatures),
            0x5 => Some(ReadBufferSize),
            0x9 => Some(ReadBD_ADDR),
            _ => None,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum LeController {
    ReadBufferSize,
    ReadLocalSupportedFeatures,
    SetAdvertisingParameters,
    SetAdvertisingData,
    SetAdvertisingEnable,
    SetScanParameters,
    SetScanEnable,
    CreateConnection,
    CreateConnectionCancel,
    StartEncryption,
    LongTermKeyRequestReply,
    ReadMaximumAdvertisingDataLength,
}

impl LeController {
    const OGF: u16 = 0x8;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::LeController::*;

        OpCodePair {
            ogf: LeController::OGF,
            ocf: match *self {
                ReadBufferSize => 0x2,
                ReadLocalSupportedFeatures => 0x3,
                SetAdvertisingParameters => 0x6,
                SetAdvertisingData => 0x8,
                SetAdvertisingEnable => 0xA,
                SetScanParameters => 0xB,
                SetScanEnable => 0xC,
                CreateConnection => 0xD,
                CreateConnectionCancel => 0xE,
                StartEncryption => 0x19,
                LongTermKeyRequestReply => 0x1A,
                ReadMaximumAdvertisingDataLength => 0x3A,
            }
        }
    }

    fn from_ocf( ocf: u16 ) -> Option<Self> {
        use self::LeController::*;

        match ocf {
            0x2 => Some(ReadBufferSize),
            0x3 => Some(ReadLocalSupportedFeatures),
            0x6 => Some(SetAdvertisingParameters),
            0x8 => Some(SetAdvertisingData),
            0xA => Some(SetAdvertisingEnable),
            0xB => Some(SetScanParameters),
            0xC => Some(SetScanEnable),
            0xD => Some(CreateConnection),
            0xE => Some(CreateConnectionCancel),
            0x19 => Some(StartEncryption),
            0x1A => Some(LongTermKeyRequestReply),
            0x3A => Some(ReadMaximumAdvertisingDataLength),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_packing() {
        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);

        // OGF 0x03 shifted into the upper 6 bits with OCF 0x0003
        assert_eq!( reset.as_opcode(), 0x0C03 );

        let read_bd_addr = HciCommand::InformationParameters(InformationParameters::ReadBD_ADDR);

        assert_eq!( read_bd_addr.as_opcode(), 0x1009 );
    }

    #[test]
    fn opcode_round_trip() {
        let commands = [
            HciCommand::LinkControl(LinkControl::CreateConnection),
            HciCommand::LinkControl(LinkControl::Disconnect),
            HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset),
            HciCommand::InformationParameters(InformationParameters::ReadBufferSize),
            HciCommand::LeController(LeController::ReadBufferSize),
            HciCommand::LeController(LeController::ReadMaximumAdvertisingDataLength),
        ];

        for command in commands.iter() {
            assert_eq!( HciCommand::from_opcode(command.as_opcode()), Some(*command) );
        }
    }

    #[test]
    fn unknown_opcode() {
        assert_eq!( HciCommand::from_opcode(0xFC00), None );
    }
}
