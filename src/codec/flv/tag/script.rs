use {
    crate::codec::flv::error::FlvError,
    bytes::Bytes,
    rml_amf0::Amf0Value,
    std::{collections::HashMap, convert::TryFrom, io::Cursor},
};

pub const SET_DATA_FRAME: &str = "@setDataFrame";
pub const ON_METADATA: &str = "onMetaData";

// Field                | Type
// -------------------- | ---
// Handler name         | AMF0 string, optionally behind "@setDataFrame"
// Arguments            | AMF0 values; onMetaData needs an object or ECMA array
#[derive(Clone)]
pub struct ScriptData {
    pub name: String,
    pub properties: Option<HashMap<String, Amf0Value>>,
    /// Tag body exactly as the publisher encoded it, without the
    /// `@setDataFrame` wrapper.
    pub body: Bytes,
}

impl ScriptData {
    pub fn is_metadata(&self) -> bool {
        self.name == ON_METADATA
    }
}

/// Encoded size of an AMF0 short string value.
fn string_len(value: &str) -> usize {
    1 + 2 + value.len()
}

impl TryFrom<Bytes> for ScriptData {
    type Error = FlvError;

    fn try_from(data: Bytes) -> Result<Self, Self::Error> {
        let values = rml_amf0::deserialize(&mut Cursor::new(data.as_ref()))
            .map_err(|e| FlvError::ScriptDecoding(format!("{:?}", e)))?;

        let mut values = values.into_iter().peekable();
        let mut body = data;
        if matches!(values.peek(), Some(Amf0Value::Utf8String(s)) if s == SET_DATA_FRAME) {
            values.next();
            body = body.slice(string_len(SET_DATA_FRAME)..);
        }

        let name = match values.next() {
            Some(Amf0Value::Utf8String(name)) => name,
            _ => return Err(FlvError::NotEnoughData("script data name")),
        };
        let properties = values.next().and_then(|v| v.get_object_properties());
        if name == ON_METADATA && properties.is_none() {
            return Err(FlvError::NotEnoughData("onMetaData properties"));
        }

        Ok(Self {
            name,
            properties,
            body,
        })
    }
}

impl std::fmt::Debug for ScriptData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptData")
            .field("name", &self.name)
            .field("properties", &self.properties.as_ref().map(|p| p.len()))
            .field("body", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: Vec<Amf0Value>) -> Bytes {
        Bytes::from(rml_amf0::serialize(&values).unwrap())
    }

    fn metadata_object() -> Amf0Value {
        let mut props = HashMap::new();
        props.insert("width".to_string(), Amf0Value::Number(1280.0));
        props.insert("duration".to_string(), Amf0Value::Number(0.0));
        props.insert("custom".to_string(), Amf0Value::Utf8String("x".to_string()));
        Amf0Value::Object(props)
    }

    #[test]
    fn test_set_data_frame_wrapper_is_stripped() {
        let inner = encode(vec![
            Amf0Value::Utf8String(ON_METADATA.to_string()),
            metadata_object(),
        ]);
        let wrapped = encode(vec![
            Amf0Value::Utf8String(SET_DATA_FRAME.to_string()),
            Amf0Value::Utf8String(ON_METADATA.to_string()),
            metadata_object(),
        ]);

        let script = ScriptData::try_from(wrapped).unwrap();
        assert!(script.is_metadata());
        assert_eq!(script.body.len(), inner.len());
        assert_eq!(&script.body[..string_len(ON_METADATA)], &inner[..string_len(ON_METADATA)]);

        let props = script.properties.unwrap();
        assert_eq!(props.get("custom"), Some(&Amf0Value::Utf8String("x".to_string())));
        assert_eq!(props.get("duration"), Some(&Amf0Value::Number(0.0)));
    }

    #[test]
    fn test_ecma_array_body_is_kept_verbatim() {
        // "onMetaData", ECMA array { width: 640 }
        let mut raw = vec![0x02, 0x00, 0x0A];
        raw.extend_from_slice(b"onMetaData");
        raw.extend_from_slice(&[0x08, 0x00, 0x00, 0x00, 0x01, 0x00, 0x05]);
        raw.extend_from_slice(b"width");
        raw.push(0x00);
        raw.extend_from_slice(&640f64.to_be_bytes());
        raw.extend_from_slice(&[0x00, 0x00, 0x09]);
        let data = Bytes::from(raw);

        let script = ScriptData::try_from(data.clone()).unwrap();
        assert!(script.is_metadata());
        assert_eq!(script.body, data);
        assert_eq!(
            script.properties.unwrap().get("width"),
            Some(&Amf0Value::Number(640.0))
        );
    }

    #[test]
    fn test_metadata_without_object_is_rejected() {
        let data = encode(vec![
            Amf0Value::Utf8String(SET_DATA_FRAME.to_string()),
            Amf0Value::Utf8String(ON_METADATA.to_string()),
        ]);
        assert!(matches!(
            ScriptData::try_from(data),
            Err(FlvError::NotEnoughData(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let data = Bytes::from_static(&[0xFF, 0x00, 0x01]);
        assert!(matches!(
            ScriptData::try_from(data),
            Err(FlvError::ScriptDecoding(_))
        ));
    }

    #[test]
    fn test_other_handlers_decode_without_properties() {
        let data = encode(vec![
            Amf0Value::Utf8String("|RtmpSampleAccess".to_string()),
            Amf0Value::Boolean(false),
            Amf0Value::Boolean(false),
        ]);
        let script = ScriptData::try_from(data).unwrap();
        assert!(!script.is_metadata());
        assert!(script.properties.is_none());
    }
}
