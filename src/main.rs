fn main() {
    std::process::exit(keepsake_lib::run());
}
