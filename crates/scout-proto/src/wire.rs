use serde::{Deserialize, Serialize};

pub const UPLOAD_PATH: &str = "/upload";

// multipart part names
pub const PART_LEFT: &str = "image_left";
pub const PART_RIGHT: &str = "image_right";
pub const PART_MASK: &str = "image_mask";
pub const FIELD_LATITUDE: &str = "latitude";
pub const FIELD_LONGITUDE: &str = "longitude";
pub const FIELD_FRAME_ID: &str = "frame_id";

/// Header that gets the upload past a tunnelling proxy's browser interstitial.
pub const TUNNEL_SKIP_HEADER: &str = "ngrok-skip-browser-warning";

/// Log value for a frame with no objects or no volumes.
pub const NONE_SENTINEL: &str = "None";

/// `gps.json` inside a buffered task folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsRecord {
    pub lat: f64,
    pub lon: f64,
    /// Source frame name, sent as `frame_id`.
    pub frame: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub objects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleRow {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub objects: String,
    pub original_img: String,
    pub predicted_img: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstaclesResponse {
    pub status: String,
    pub data: Vec<ObstacleRow>,
    /// Malformed log rows skipped while reading.
    #[serde(default)]
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { status: "error".into(), error: error.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_record_uses_short_keys() {
        let rec: GpsRecord = serde_json::from_str(r#"{"lat":48.84,"lon":2.30,"frame":"x"}"#).unwrap();
        assert_eq!(rec, GpsRecord { lat: 48.84, lon: 2.30, frame: "x".into() });
    }

    #[test]
    fn upload_response_omits_missing_volumes() {
        let r = UploadResponse { status: "success".into(), objects: vec!["cone".into()], volumes: None };
        let s = serde_json::to_string(&r).unwrap();
        assert!(!s.contains("volumes"));
        let back: UploadResponse = serde_json::from_str(&s).unwrap();
        assert!(back.volumes.is_none());
    }
}
