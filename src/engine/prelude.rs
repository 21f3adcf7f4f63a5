use crate::bindings::BindingManager;

const ALIASES: &str = "\
alias int = i32;
alias uint = u32;
alias float = f32;
alias int2 = vec2<i32>;
alias int3 = vec3<i32>;
alias int4 = vec4<i32>;
alias uint2 = vec2<u32>;
alias uint3 = vec3<u32>;
alias uint4 = vec4<u32>;
alias float2 = vec2<f32>;
alias float3 = vec3<f32>;
alias float4 = vec4<f32>;
alias bool2 = vec2<bool>;
alias bool3 = vec3<bool>;
alias bool4 = vec4<bool>;
alias float2x2 = mat2x2<f32>;
alias float2x3 = mat2x3<f32>;
alias float2x4 = mat2x4<f32>;
alias float3x2 = mat3x2<f32>;
alias float3x3 = mat3x3<f32>;
alias float3x4 = mat3x4<f32>;
alias float4x2 = mat4x2<f32>;
alias float4x3 = mat4x3<f32>;
alias float4x4 = mat4x4<f32>;
";

const HOST_STRUCTS: &str = "\
struct Time { frame: uint, elapsed: float, delta: float }
struct Mouse { pos: int2, zoom: float, click: int, start: int2, delta: int2 }
struct DispatchInfo { id: uint }
";

const HELPERS: &str = "\
fn keyDown(keycode: uint) -> bool {
    return ((_keyboard[keycode / 128u][(keycode % 128u) / 32u] >> (keycode % 32u)) & 1u) == 1u;
}
fn passStore(pass_index: int, coord: int2, value: float4) {
    textureStore(pass_out, coord, pass_index, value);
}
fn passLoad(pass_index: int, coord: int2, lod: int) -> float4 {
    return textureLoad(pass_in, coord, pass_index, lod);
}
fn passSampleLevelBilinearRepeat(pass_index: int, uv: float2, lod: float) -> float4 {
    let level = int(lod);
    let size = int2(textureDimensions(pass_in, level));
    let p = fract(uv) * float2(size) - 0.5;
    let base = int2(floor(p));
    let f = fract(p);
    let a = passLoad(pass_index, (base + size) % size, level);
    let b = passLoad(pass_index, (base + int2(1, 0) + size) % size, level);
    let c = passLoad(pass_index, (base + int2(0, 1) + size) % size, level);
    let d = passLoad(pass_index, (base + int2(1, 1) + size) % size, level);
    return mix(mix(a, b, f.x), mix(c, d, f.x), f.y);
}
";

const ASSERT_HELPER: &str = "\
fn assert(index: int, success: bool) {
    if (!success) {
        atomicAdd(&_assert_counts[index], 1u);
    }
}
";

/// WGSL placed between the `enable` lines and the user's program.
pub fn generate(bindings: &BindingManager) -> String {
    let mut prelude = String::new();
    prelude.push_str(ALIASES);
    prelude.push_str(HOST_STRUCTS);
    prelude.push_str(&bindings.custom.host.declaration());
    prelude.push_str(&bindings.declarations());
    prelude.push_str(HELPERS);
    if bindings.asserts.is_some() {
        prelude.push_str(ASSERT_HELPER);
    }
    prelude
}
