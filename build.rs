fn main() {
    println!("cargo:rerun-if-changed=tauri.conf.json");
    println!("cargo:rerun-if-changed=ui");

    #[cfg(feature = "desktop")]
    tauri_build::build();
}
