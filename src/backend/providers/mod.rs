pub mod http_json;
