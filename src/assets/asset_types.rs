use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// Content type of an asset, with the codes used on the wire
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(i8)]
pub enum AssetType {
    #[num_enum(default)]
    Unknown = -1,
    Texture = 0,
    Sound = 1,
    CallingCard = 2,
    Landmark = 3,
    Clothing = 5,
    Object = 6,
    Notecard = 7,
    Folder = 8,
    LslText = 10,
    LslBytecode = 11,
    TextureTga = 12,
    Bodypart = 13,
    SoundWav = 17,
    ImageTga = 18,
    ImageJpeg = 19,
    Animation = 20,
    Gesture = 21,
    Simstate = 22,
    Link = 24,
    LinkFolder = 25,
    MarketplaceFolder = 26,
    Mesh = 49,
}

impl AssetType {
    /// Transfer parameter blocks and packet fields carry the type in a wider integer
    pub fn from_wire(code: i32) -> AssetType {
        i8::try_from(code)
            .map(AssetType::from_primitive)
            .unwrap_or(AssetType::Unknown)
    }

    pub fn wire_code(self) -> i32 {
        i8::from(self) as i32
    }
}

/// Status of a Transfer as reported by the server
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Done = 1,
    Skip = 2,
    Abort = 3,
    Error = -1,
    UnknownSource = -2,
    InsufficientPermissions = -3,
    #[num_enum(default)]
    Unknown = -4,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ChannelType {
    #[num_enum(default)]
    Unknown = 0,
    Misc = 1,
    Asset = 2,
}

/// Where the server looks up the content of a Transfer
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SourceType {
    #[num_enum(default)]
    Unknown = 0,
    Asset = 2,
    SimInventoryItem = 3,
    SimEstate = 4,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum TargetType {
    #[num_enum(default)]
    Unknown = 0,
    File = 1,
    VFile = 2,
}

/// Result codes of an aborted Xfer
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum TransferError {
    None = 0,
    Failed = -1,
    AssetNotFound = -3,
    AssetNotFoundInDatabase = -4,
    InsufficientPermissions = -5,
    Eof = -39,
    CannotOpenFile = -42,
    FileNotFound = -43,
    FileIsEmpty = -44,
    TcpTimeout = -23016,
    CircuitGone = -23017,
}

impl TransferError {
    pub fn from_wire(code: i32) -> TransferError {
        TransferError::try_from(code)
            .unwrap_or(TransferError::Failed)
    }
}
