// Build script to compile the scene shaders
//
// SPIR-V for Vulkan with glslc, DXBC for D3D11/D3D12 with fxc on Windows.
// GL and GLES load their GLSL sources from shaders/ at runtime.

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    compile_spirv("shaders/VertexShader_Vulkan.glsl", "vert", "shaders/VertexShader.spv");
    compile_spirv("shaders/PixelShader_Vulkan.glsl", "frag", "shaders/PixelShader.spv");

    if std::env::var_os("CARGO_CFG_WINDOWS").is_some() {
        for model in ["5_0", "5_1"] {
            compile_hlsl(
                "shaders/VertexShader.hlsl",
                &format!("vs_{}", model),
                &format!("shaders/VertexShader_{}.cso", model),
            );
            compile_hlsl(
                "shaders/PixelShader.hlsl",
                &format!("ps_{}", model),
                &format!("shaders/PixelShader_{}.cso", model),
            );
        }
    }
}

fn compile_spirv(input: &str, stage: &str, output: &str) {
    let result = Command::new("glslc")
        .arg(format!("-fshader-stage={}", stage))
        .arg(Path::new(input))
        .arg("-o")
        .arg(Path::new(output))
        .status();
    report("glslc", input, output, result);
}

fn compile_hlsl(input: &str, profile: &str, output: &str) {
    let result = Command::new("fxc")
        .args(["/nologo", "/E", "main", "/T", profile, "/Fo", output, input])
        .status();
    report("fxc", input, output, result);
}

fn report(
    tool: &str,
    input: &str,
    output: &str,
    result: std::io::Result<std::process::ExitStatus>,
) {
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // The scene falls back to clearing when shaders are missing
            println!("cargo:warning={} not found ({}); {} not built", tool, e, output);
        }
    }
}
