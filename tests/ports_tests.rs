use scanwatch::ports::{load_ports_from_path, normalize_ports, parse_ports_str};
use std::io::Write;

#[test]
fn parse_single_and_ranges_and_comments() {
    let input = r#"
        # common ports
        22
        80  # http
        443, 8443 # https
        8000-8002
        8001  # duplicate
        # blank line follows

    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    // Dedup, preserve insertion order of first appearance
    assert_eq!(ports, vec![22, 80, 443, 8443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_ports_str("0\n").is_err());
    assert!(normalize_ports("22,0").is_err());
}

#[test]
fn ports_file_is_normalized() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "# web\n443\n80\n81-82 # alt").expect("write");
    let spec = load_ports_from_path(file.path()).expect("load ok");
    assert_eq!(spec, "80-82,443");
}
