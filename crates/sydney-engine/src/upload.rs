use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sydney_contracts::session::{set_header, SessionContext};
use tracing::info;

use crate::error::{Result, SydneyError};
use crate::http::{HttpRequest, HttpTransport};

pub const KBLOB_URL: &str = "https://www.bing.com/images/kblob";
pub const BLOB_URL_PREFIX: &str = "https://www.bing.com/images/blob?bcid=";

const UPLOAD_REFERER: &str = "https://www.bing.com/search?q=Bing+AI&showconv=1&FORM=hpcodx";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadPayload {
    image_info: Map<String, Value>,
    knowledge_request: KnowledgeRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KnowledgeRequest {
    invoked_skills: Vec<String>,
    subscription_id: String,
    invoked_skills_request_data: InvokedSkillsRequestData,
    convo_data: ConvoData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokedSkillsRequestData {
    enable_face_blur: bool,
}

#[derive(Debug, Serialize)]
struct ConvoData {
    convoid: String,
    convotone: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UploadResponse {
    blob_id: String,
    processed_blob_id: String,
}

/// Re-encode any decodable picture as an opaque JPEG. Transparent pixels are
/// blended onto white.
pub fn encode_jpeg(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| SydneyError::Other(format!("cannot decode image: {err}")))?;
    let rgba = decoded.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let rgb = DynamicImage::ImageRgba8(flattened).to_rgb8();
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY)
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .map_err(|err| SydneyError::Other(format!("cannot encode jpeg: {err}")))?;
    Ok(encoded)
}

/// Upload a picture for the next turn and return the URL to attach to it.
pub fn upload_image(
    http: &dyn HttpTransport,
    session: &SessionContext,
    bytes: &[u8],
) -> Result<String> {
    let jpeg = encode_jpeg(bytes)?;
    let payload = UploadPayload {
        image_info: Map::new(),
        knowledge_request: KnowledgeRequest {
            invoked_skills: vec!["ImageById".to_string()],
            subscription_id: "Bing.Chat.Multimodal".to_string(),
            invoked_skills_request_data: InvokedSkillsRequestData {
                enable_face_blur: false,
            },
            convo_data: ConvoData {
                convoid: String::new(),
                convotone: session.style.as_str().to_string(),
            },
        },
    };
    let knowledge_request = serde_json::to_string(&payload)
        .map_err(|err| SydneyError::Other(format!("cannot encode upload payload: {err}")))?;

    let mut headers = session.image_headers();
    set_header(&mut headers, "referer", UPLOAD_REFERER);
    let request = HttpRequest::post_multipart(
        KBLOB_URL,
        vec![
            ("knowledgeRequest".to_string(), knowledge_request),
            ("imageBase64".to_string(), BASE64.encode(&jpeg)),
        ],
    )
    .with_headers(headers)
    .with_timeout(UPLOAD_TIMEOUT);
    let response: UploadResponse = http.execute(request)?.json_or_error("image upload")?;
    if response.blob_id.is_empty() {
        return Err(SydneyError::Http("image upload returned an empty blobId".to_string()));
    }
    info!(
        blob_id = response.blob_id.as_str(),
        processed = response.processed_blob_id.as_str(),
        "uploaded image"
    );
    Ok(format!("{BLOB_URL_PREFIX}{}", response.blob_id))
}
