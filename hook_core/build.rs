extern crate winres;

fn main() {
    if cfg!(target_os = "windows") {
        // a dll has no icon, but the version strings still come from [package.metadata.winres]
        let res = winres::WindowsResource::new();
        res.compile().unwrap();
    }
}
