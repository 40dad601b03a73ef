use std::env;

fn main() {
    // cuda フィーチャー有効時のみ CUDA ライブラリの探索パスを追加
    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        if let Ok(cuda_path) = env::var("CUDA_PATH") {
            println!("cargo:rustc-link-search=native={}/lib64", cuda_path);
            println!("cargo:rustc-link-search=native={}/lib", cuda_path);
        }

        println!("cargo:rustc-link-search=native=/usr/local/cuda/lib64");
        println!("cargo:rustc-link-search=native=/opt/cuda/lib64");
    }

    // OpenCL は whisper-rs 側のビルドに任せ、リンク先だけ明示
    if env::var("CARGO_FEATURE_OPENCL").is_ok() {
        println!("cargo:rustc-link-lib=OpenCL");
    }

    println!("cargo:rerun-if-env-changed=CUDA_PATH");
}
