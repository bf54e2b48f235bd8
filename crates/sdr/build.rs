fn main() {
    #[cfg(feature = "soapysdr")]
    {
        println!("cargo:rustc-link-lib=SoapySDR");
    }

    #[cfg(feature = "rtlsdr")]
    {
        println!("cargo:rustc-link-lib=rtlsdr");
    }
}
