use bytes::Bytes;
use uuid::Uuid;

use crate::assets::asset_types::AssetType;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssetData {
    pub asset_id: Uuid,
    pub data: Bytes,
}

/// Downloaded asset content, tagged by the kind of asset it is. Decoding the content itself is
///  up to the consumer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Asset {
    Texture(AssetData),
    Sound(AssetData),
    Landmark(AssetData),
    Clothing(AssetData),
    Bodypart(AssetData),
    Notecard(AssetData),
    LslText(AssetData),
    LslBytecode(AssetData),
    Object(AssetData),
    Gesture(AssetData),
    Animation(AssetData),
    Mesh(AssetData),
    /// an asset type without a specific wrapper
    Other(AssetType, AssetData),
}

impl Asset {
    pub fn wrap(asset_type: AssetType, asset_id: Uuid, data: Bytes) -> Asset {
        let content = AssetData { asset_id, data };
        match asset_type {
            AssetType::Texture => Asset::Texture(content),
            AssetType::Sound => Asset::Sound(content),
            AssetType::Landmark => Asset::Landmark(content),
            AssetType::Clothing => Asset::Clothing(content),
            AssetType::Bodypart => Asset::Bodypart(content),
            AssetType::Notecard => Asset::Notecard(content),
            AssetType::LslText => Asset::LslText(content),
            AssetType::LslBytecode => Asset::LslBytecode(content),
            AssetType::Object => Asset::Object(content),
            AssetType::Gesture => Asset::Gesture(content),
            AssetType::Animation => Asset::Animation(content),
            AssetType::Mesh => Asset::Mesh(content),
            other => Asset::Other(other, content),
        }
    }

    pub fn asset_type(&self) -> AssetType {
        match self {
            Asset::Texture(_) => AssetType::Texture,
            Asset::Sound(_) => AssetType::Sound,
            Asset::Landmark(_) => AssetType::Landmark,
            Asset::Clothing(_) => AssetType::Clothing,
            Asset::Bodypart(_) => AssetType::Bodypart,
            Asset::Notecard(_) => AssetType::Notecard,
            Asset::LslText(_) => AssetType::LslText,
            Asset::LslBytecode(_) => AssetType::LslBytecode,
            Asset::Object(_) => AssetType::Object,
            Asset::Gesture(_) => AssetType::Gesture,
            Asset::Animation(_) => AssetType::Animation,
            Asset::Mesh(_) => AssetType::Mesh,
            Asset::Other(asset_type, _) => *asset_type,
        }
    }

    pub fn content(&self) -> &AssetData {
        match self {
            Asset::Texture(c) | Asset::Sound(c) | Asset::Landmark(c) | Asset::Clothing(c)
            | Asset::Bodypart(c) | Asset::Notecard(c) | Asset::LslText(c) | Asset::LslBytecode(c)
            | Asset::Object(c) | Asset::Gesture(c) | Asset::Animation(c) | Asset::Mesh(c)
            | Asset::Other(_, c) => c,
        }
    }

    pub fn asset_id(&self) -> Uuid {
        self.content().asset_id
    }

    pub fn data(&self) -> &Bytes {
        &self.content().data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::texture(AssetType::Texture)]
    #[case::notecard(AssetType::Notecard)]
    #[case::mesh(AssetType::Mesh)]
    #[case::folder(AssetType::Folder)]
    #[case::unknown(AssetType::Unknown)]
    fn test_wrap_keeps_type_and_content(#[case] asset_type: AssetType) {
        let id = Uuid::from_u128(42);
        let asset = Asset::wrap(asset_type, id, Bytes::from_static(b"abc"));
        assert_eq!(asset.asset_type(), asset_type);
        assert_eq!(asset.asset_id(), id);
        assert_eq!(asset.data().as_ref(), b"abc");
    }

    #[test]
    fn test_texture_gets_its_own_wrapper() {
        let asset = Asset::wrap(AssetType::Texture, Uuid::nil(), Bytes::new());
        assert!(matches!(asset, Asset::Texture(_)));
    }
}
