use std::env;

fn main() {
    let default_binary =
        env::var("KUBE_AUTH_PROXY_BINARY").unwrap_or_else(|_| "kube-auth-proxy".into());

    println!("cargo::rerun-if-env-changed=KUBE_AUTH_PROXY_BINARY");
    println!("cargo::rustc-env=KUBE_AUTH_PROXY_BINARY={}", default_binary);
}
