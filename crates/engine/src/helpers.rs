//! Helper functions exposed to scripts.
//!
//! All helpers are pure with respect to the sandbox: they only return
//! integers/numbers and never retain Lua values. Arguments are checked
//! strictly (count and type); strings are not coerced to numbers.

use std::time::Instant;

use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value};

/// Register `timestamp`, `hsv`, `gradient` and `noise` as globals.
pub fn install(lua: &Lua, started: Instant) -> LuaResult<()> {
    let globals = lua.globals();

    let timestamp = lua.create_function(move |_, args: MultiValue| {
        let args: Vec<Value> = args.into_iter().collect();
        check_arity("timestamp", &args, 0, 0)?;
        Ok(started.elapsed().as_nanos() as i64)
    })?;
    globals.set("timestamp", timestamp)?;

    let hsv = lua.create_function(|_, args: MultiValue| {
        let args: Vec<Value> = args.into_iter().collect();
        check_arity("hsv", &args, 3, 3)?;
        let h = number_arg("hsv", &args, 0)?;
        let s = number_arg("hsv", &args, 1)?;
        let v = number_arg("hsv", &args, 2)?;
        Ok(hsv_to_rgb(h, s, v))
    })?;
    globals.set("hsv", hsv)?;

    let gradient = lua.create_function(|_, args: MultiValue| {
        let args: Vec<Value> = args.into_iter().collect();
        check_arity("gradient", &args, 2, 2)?;
        let stops = match &args[0] {
            Value::Table(t) => read_stops(t)?,
            other => {
                return Err(arg_error("gradient", 1, "a table of {r, g, b} stops", other));
            }
        };
        let t = number_arg("gradient", &args, 1)?;
        Ok(sample_gradient(&stops, t))
    })?;
    globals.set("gradient", gradient)?;

    let noise = lua.create_function(|_, args: MultiValue| {
        let args: Vec<Value> = args.into_iter().collect();
        check_arity("noise", &args, 1, 2)?;
        let x = number_arg("noise", &args, 0)?;
        let y = if args.len() > 1 { number_arg("noise", &args, 1)? } else { 0.0 };
        Ok(perlin2(x, y))
    })?;
    globals.set("noise", noise)?;

    Ok(())
}

fn check_arity(name: &str, args: &[Value], min: usize, max: usize) -> LuaResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(mlua::Error::RuntimeError(format!(
            "{}: expected {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn number_arg(name: &str, args: &[Value], index: usize) -> LuaResult<f64> {
    match &args[index] {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) if n.is_finite() => Ok(*n),
        other => Err(arg_error(name, index + 1, "a finite number", other)),
    }
}

fn arg_error(name: &str, position: usize, expected: &str, got: &Value) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "{}: argument #{} must be {}, got {}",
        name,
        position,
        expected,
        got.type_name()
    ))
}

fn read_stops(table: &Table) -> LuaResult<Vec<[f64; 3]>> {
    let len = table.raw_len();
    if len == 0 {
        return Err(mlua::Error::RuntimeError(
            "gradient: stops must not be empty".to_string(),
        ));
    }
    let mut stops = Vec::with_capacity(len);
    for i in 1..=len {
        let stop: Value = table.raw_get(i)?;
        let Value::Table(stop) = stop else {
            return Err(mlua::Error::RuntimeError(format!(
                "gradient: stop #{} must be an {{r, g, b}} table, got {}",
                i,
                stop.type_name()
            )));
        };
        let mut rgb = [0.0; 3];
        for (channel, slot) in rgb.iter_mut().enumerate() {
            *slot = match stop.raw_get::<Value>(channel + 1)? {
                Value::Integer(v) => v as f64,
                Value::Number(v) if v.is_finite() => v,
                other => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "gradient: stop #{} channel {} must be a number, got {}",
                        i,
                        channel + 1,
                        other.type_name()
                    )));
                }
            };
        }
        stops.push(rgb);
    }
    Ok(stops)
}

fn to_byte(v: f64) -> i64 {
    v.round().clamp(0.0, 255.0) as i64
}

/// HSV to RGB; `h` wraps modulo 1, `s` and `v` clamp to [0, 1].
pub(crate) fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (i64, i64, i64) {
    let h = h.rem_euclid(1.0) * 6.0;
    let s = s.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);

    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match sector as u8 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    (to_byte(r * 255.0), to_byte(g * 255.0), to_byte(b * 255.0))
}

/// Linear interpolation across evenly spaced stops.
pub(crate) fn sample_gradient(stops: &[[f64; 3]], t: f64) -> (i64, i64, i64) {
    if stops.len() == 1 {
        let [r, g, b] = stops[0];
        return (to_byte(r), to_byte(g), to_byte(b));
    }
    let pos = t.clamp(0.0, 1.0) * (stops.len() - 1) as f64;
    let i = (pos.floor() as usize).min(stops.len() - 2);
    let frac = pos - i as f64;
    let lerp = |a: f64, b: f64| a + (b - a) * frac;
    let (a, b) = (stops[i], stops[i + 1]);
    (
        to_byte(lerp(a[0], b[0])),
        to_byte(lerp(a[1], b[1])),
        to_byte(lerp(a[2], b[2])),
    )
}

fn lattice_hash(x: i64, y: i64) -> u64 {
    let mut h = (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 32;
    h
}

fn grad(hash: u64, dx: f64, dy: f64) -> f64 {
    match hash & 7 {
        0 => dx + dy,
        1 => dx - dy,
        2 => -dx + dy,
        3 => -dx - dy,
        4 => dx,
        5 => -dx,
        6 => dy,
        _ => -dy,
    }
}

fn fade(t: f64) -> f64 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

/// 2D gradient noise in [-1, 1]; deterministic for a given (x, y).
pub(crate) fn perlin2(x: f64, y: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (xi, yi) = (x0 as i64, y0 as i64);
    let (dx, dy) = (x - x0, y - y0);

    let n00 = grad(lattice_hash(xi, yi), dx, dy);
    // Huge inputs saturate the cast; neighbours wrap instead of overflowing
    let (xj, yj) = (xi.wrapping_add(1), yi.wrapping_add(1));

    let n10 = grad(lattice_hash(xj, yi), dx - 1.0, dy);
    let n01 = grad(lattice_hash(xi, yj), dx, dy - 1.0);
    let n11 = grad(lattice_hash(xj, yj), dx - 1.0, dy - 1.0);

    let u = fade(dx);
    let v = fade(dy);
    let nx0 = n00 + u * (n10 - n00);
    let nx1 = n01 + u * (n11 - n01);
    // Diagonal gradients reach magnitude 2 at cell centers
    ((nx0 + v * (nx1 - nx0)) * 0.5).clamp(-1.0, 1.0)
}
