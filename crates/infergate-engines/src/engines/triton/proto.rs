//! KServe v2 `inference.GRPCInferenceService` messages and client

#![allow(clippy::all)]

tonic::include_proto!("inference");

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_field_tags_on_the_wire() {
        let request = ModelInferRequest {
            model_name: "m".to_string(),
            ..Default::default()
        };
        // field 1, wire type 2 (length-delimited), length 1, 'm'
        assert_eq!(request.encode_to_vec(), vec![0x0a, 0x01, b'm']);

        let response = ModelInferResponse {
            raw_output_contents: vec![vec![7]],
            ..Default::default()
        };
        // field 6, wire type 2
        assert_eq!(response.encode_to_vec(), vec![0x32, 0x01, 7]);
    }
}
