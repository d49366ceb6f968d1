pub mod common;
pub mod http;
pub mod services;
pub mod utils;

pub const DEFAULT_SUB_URL: &str =
    "https://github.com/Epodonios/v2ray-configs/raw/main/Splitted-By-Protocol/vless.txt";

pub const DEFAULT_PROBE_URL: &str = "http://www.google.com/generate_204";

pub const TOP_K: usize = 25;

pub const DEFAULT_XRAY_PATH: &str = "/usr/local/bin/xray";
pub const DEFAULT_XRAY_ASSETS_PATH: &str = "/usr/share/xray/";
